//! Error types shared across the drain service.
//!
//! Each boundary gets its own enum: the source store, the sink, the record
//! codec and the cycle as a whole. None of them is fatal to the process; the
//! engine logs them and moves on.

use thiserror::Error;

/// Errors that can occur while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors returned by the source store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Source store transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("Source store unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the sink writer
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink transport error on {node}: {source}")]
    Transport {
        node: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Sink rejected write (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("No sink node reachable: {0}")]
    Unreachable(String),

    #[error("Record not writable: {0}")]
    Unwritable(String),
}

/// Errors that can occur while decoding a queued payload.
///
/// Decode errors are permanent: the same bytes will never decode on retry.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed telemetry payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Reasons a drain cycle did not run
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("A drain cycle is already running")]
    AlreadyRunning,

    #[error("Key enumeration failed: {0}")]
    Enumerate(#[source] StoreError),
}
