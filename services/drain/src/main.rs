use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_drain::api::{start_api_server, AppState};
use telemetry_drain::{
    Config, DrainEngine, DrainScheduler, DrainSettings, IotdbSink, JsonRecordCodec,
    RedisSourceStore,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, config.service.json_logs);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting telemetry drain service"
    );

    // Initialize metrics
    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let store = Arc::new(
        RedisSourceStore::new(&config.redis)
            .await
            .context("Failed to connect to Redis")?,
    );

    let sink = Arc::new(
        IotdbSink::new(&config.iotdb, config.sink_request_timeout())
            .context("Failed to initialize IoTDB sink")?,
    );

    let settings = DrainSettings::from_config(&config.drain, config.iotdb.write_mode);
    info!(
        batch_size = settings.batch_size,
        key_concurrency = settings.key_concurrency,
        write_mode = ?settings.write_mode,
        nodes = ?config.iotdb.nodes,
        "Drain engine configured"
    );

    let engine = Arc::new(DrainEngine::new(
        store,
        sink,
        Arc::new(JsonRecordCodec),
        settings,
    ));

    let shutdown = CancellationToken::new();

    // Spawn scheduler task
    let mut scheduler_handle =
        DrainScheduler::new(engine.clone(), config.drain_interval(), shutdown.clone()).spawn();

    // Spawn API server task
    let api_handle = if config.api.enabled {
        let api_state = AppState {
            engine: engine.clone(),
        };
        let api_config = config.api.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config).await {
                error!(error = %e, "API server error");
            }
        }))
    } else {
        None
    };

    info!("Drain service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down drain service");

    if let Some(handle) = api_handle {
        handle.abort();
    }

    // Let an in-flight cycle finish; abandoning it is safe since trims only
    // follow confirmed writes.
    shutdown.cancel();
    if tokio::time::timeout(config.shutdown_grace(), &mut scheduler_handle)
        .await
        .is_err()
    {
        warn!(
            grace_secs = config.drain.shutdown_grace_secs,
            "Drain cycle did not finish in time, abandoning it"
        );
        scheduler_handle.abort();
    }

    info!("Drain service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
