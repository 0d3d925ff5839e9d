//! Telemetry Drain Service
//!
//! Periodically moves buffered telemetry out of Redis queues and persists it
//! into IoTDB. Producers append JSON-encoded positions to Redis lists; this
//! service reads each list head-first in bounded batches, writes the records
//! to the time-series store, and trims a batch from the list only after every
//! record in it was confirmed written.
//!
//! ## Guarantees
//!
//! - **Prefix safety**: a list is never trimmed past an element that was not
//!   persisted. A batch with any failure stays at the head of its list.
//! - **At-least-once**: a crash between persist and trim re-delivers the
//!   batch on the next cycle.
//! - **Isolation**: a failing key, a malformed payload, or a store outage
//!   never stops the other keys or the scheduler.
//!
//! ## Architecture
//!
//! ```text
//!  Scheduler / API               Redis                       IoTDB
//! ┌──────────────┐          ┌──────────────┐           ┌──────────────┐
//! │ DrainEngine  │──scan───▶│ queue keys   │           │ root.vehicle │
//! │  run_cycle   │──range──▶│  (lists)     │           │   .d{id}     │
//! └──────────────┘          └──────────────┘           └──────────────┘
//!        │                         ▲                          ▲
//!        ▼                         │ trim / delete            │ insertRecords
//! ┌──────────────┐          ┌──────────────┐           ┌──────────────┐
//! │ RecordCodec  │─────────▶│ drain_key    │──────────▶│ SinkWriter   │
//! └──────────────┘          └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod record;
pub mod scheduler;
pub mod sink;
pub mod source_store;

pub use config::Config;
pub use engine::{
    CleanupOutcome, CycleReport, DrainEngine, DrainSettings, HaltReason, KeyDrain, KeyOutcome,
    KeyReport,
};
pub use error::{ConfigError, CycleError, DecodeError, SinkError, StoreError};
pub use record::{JsonRecordCodec, RecordCodec, TelemetryRecord};
pub use scheduler::DrainScheduler;
pub use sink::{IotdbSink, SinkWriter, WriteMode};
pub use source_store::{KeyType, RedisSourceStore, SourceStore};
