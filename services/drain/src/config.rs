use crate::error::ConfigError;
use crate::sink::WriteMode;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the drain service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Redis (source store) configuration
    pub redis: RedisConfig,
    /// IoTDB (sink) configuration
    pub iotdb: IotdbConfig,
    /// Drain loop tuning
    #[serde(default)]
    pub drain: DrainConfig,
    /// Manual trigger API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default = "default_true")]
    pub json_logs: bool,
    /// Metrics port, 0 disables the Prometheus exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Redis connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL, e.g. `redis://:password@127.0.0.1:6379/0`
    pub url: String,
    /// Number of multiplexed connections shared across keys
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,
    /// COUNT hint passed to SCAN during key enumeration
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

/// IoTDB REST configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IotdbConfig {
    /// REST base URLs, e.g. `http://127.0.0.1:18080`
    pub nodes: Vec<String>,
    /// Username for basic auth
    #[serde(default = "default_iotdb_user")]
    pub username: String,
    /// Password for basic auth
    #[serde(default = "default_iotdb_user")]
    pub password: String,
    /// Maximum idle connections kept per node
    #[serde(default = "default_iotdb_pool_size")]
    pub pool_size: usize,
    /// Path prefix for device timeseries; records land under `{prefix}.d{device_id}`
    #[serde(default = "default_device_prefix")]
    pub device_prefix: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Insert records one at a time or grouped by device
    #[serde(default)]
    pub write_mode: WriteMode,
}

/// Drain loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    /// Delay between the end of one cycle and the start of the next
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Maximum elements read from the head of a list per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Consecutive empty reads after which a key counts as drained
    #[serde(default = "default_max_consecutive_empty")]
    pub max_consecutive_empty: u32,
    /// Attempts made to remove an emptied key
    #[serde(default = "default_max_delete_attempts")]
    pub max_delete_attempts: u32,
    /// Pattern passed to key enumeration
    #[serde(default = "default_key_pattern")]
    pub key_pattern: String,
    /// Number of keys drained concurrently within one cycle
    #[serde(default = "default_key_concurrency")]
    pub key_concurrency: usize,
    /// How long shutdown waits for an in-flight cycle
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// API configuration for the manual trigger endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the HTTP API at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

// Default value functions
fn default_service_name() -> String {
    "telemetry-drain".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_redis_pool_size() -> usize {
    4
}

fn default_scan_count() -> usize {
    500
}

fn default_iotdb_user() -> String {
    "root".to_string()
}

fn default_iotdb_pool_size() -> usize {
    8
}

fn default_device_prefix() -> String {
    "root.vehicle".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    100
}

fn default_max_consecutive_empty() -> u32 {
    3
}

fn default_max_delete_attempts() -> u32 {
    3
}

fn default_key_pattern() -> String {
    "*".to_string()
}

fn default_key_concurrency() -> usize {
    1
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/drain").required(false))
            .add_source(config::File::with_name("/etc/telemetry-drain/drain").required(false))
            // Override with environment variables
            // DRAIN__REDIS__URL -> redis.url
            // DRAIN__IOTDB__NODES=http://a:18080,http://b:18080 -> iotdb.nodes
            .add_source(Self::environment())
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides, `DRAIN__<SECTION>__<KEY>`
    fn environment() -> config::Environment {
        config::Environment::with_prefix("DRAIN")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("iotdb.nodes")
            .try_parsing(true)
    }

    /// Reject settings the drain loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iotdb.nodes.is_empty() {
            return Err(ConfigError::MissingRequired("iotdb.nodes".to_string()));
        }
        if self.redis.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("redis.url".to_string()));
        }

        let positive = [
            ("drain.interval_secs", self.drain.interval_secs),
            ("drain.batch_size", self.drain.batch_size as u64),
            ("drain.max_consecutive_empty", self.drain.max_consecutive_empty as u64),
            ("drain.max_delete_attempts", self.drain.max_delete_attempts as u64),
            ("drain.key_concurrency", self.drain.key_concurrency as u64),
            ("redis.pool_size", self.redis.pool_size as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Get the scheduling delay as Duration
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain.interval_secs)
    }

    /// Get the shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.drain.shutdown_grace_secs)
    }

    /// Get the sink request timeout as Duration
    pub fn sink_request_timeout(&self) -> Duration {
        Duration::from_secs(self.iotdb.request_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            json_logs: true,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            max_consecutive_empty: default_max_consecutive_empty(),
            max_delete_attempts: default_max_delete_attempts(),
            key_pattern: default_key_pattern(),
            key_concurrency: default_key_concurrency(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}
