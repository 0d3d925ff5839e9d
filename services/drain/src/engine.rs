//! Drain engine.
//!
//! One cycle enumerates every key in the source store, skips anything that is
//! not a list, and drains each list head-first in bounded batches. A batch is
//! trimmed from the list only when every element in it was persisted; any
//! failure leaves the whole batch at the head for the next cycle.
//!
//! ```text
//! scan_keys ─▶ key_type ─▶ ┌──────────── drain_key ────────────┐ ─▶ cleanup_if_empty
//!                          │ range(0, n-1) ─▶ decode ─▶ persist │
//!                          │        ▲                   │       │
//!                          │        └──── trim(n, -1) ◀─┘       │
//!                          └────────────────────────────────────┘
//! ```

use crate::config::DrainConfig;
use crate::error::{CycleError, StoreError};
use crate::record::{RecordCodec, TelemetryRecord};
use crate::sink::{SinkWriter, WriteMode};
use crate::source_store::{KeyType, SourceStore};
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Tuning for the drain loop
#[derive(Debug, Clone)]
pub struct DrainSettings {
    /// Elements read per batch
    pub batch_size: usize,
    /// Consecutive empty reads that end a key's loop
    pub max_consecutive_empty: u32,
    /// Attempts made by `cleanup_if_empty`
    pub max_delete_attempts: u32,
    /// Pattern used for key enumeration
    pub key_pattern: String,
    /// Keys drained concurrently
    pub key_concurrency: usize,
    /// Per-record or grouped sink writes
    pub write_mode: WriteMode,
}

impl DrainSettings {
    pub fn from_config(config: &DrainConfig, write_mode: WriteMode) -> Self {
        Self {
            batch_size: config.batch_size,
            max_consecutive_empty: config.max_consecutive_empty,
            max_delete_attempts: config.max_delete_attempts,
            key_pattern: config.key_pattern.clone(),
            key_concurrency: config.key_concurrency,
            write_mode,
        }
    }
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self::from_config(&DrainConfig::default(), WriteMode::default())
    }
}

/// Why a key stopped before it was exhausted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum HaltReason {
    /// Some element of the batch was not persisted
    PartialBatch { succeeded: usize, batch_size: usize },
    /// The batch was persisted but could not be trimmed
    TrimFailed,
}

/// Result of draining one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDrain {
    /// Records persisted and trimmed during this cycle
    pub persisted: u64,
    /// Records that failed to decode or persist
    pub failed: u64,
    /// Set when the loop stopped on a failure instead of running dry
    pub halt: Option<HaltReason>,
}

/// Result of `cleanup_if_empty`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    /// The key was empty and has been removed
    Deleted,
    /// The key no longer existed; nothing was done
    Absent,
    /// New elements arrived; the key was left alone
    NotEmpty(u64),
    /// Every attempt failed; the key was left alone
    Exhausted,
}

/// Terminal state of one key within a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Not a list, absent, or its type could not be read
    Skipped,
    Drained(KeyDrain),
    /// Processing panicked; the key is retried next cycle
    Panicked,
}

/// Per-key entry of a cycle report
#[derive(Debug, Clone)]
pub struct KeyReport {
    pub key: String,
    pub outcome: KeyOutcome,
    pub cleanup: Option<CleanupOutcome>,
}

/// Summary of a drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub keys_seen: usize,
    pub keys_skipped: usize,
    pub keys_drained: usize,
    pub keys_halted: usize,
    pub keys_panicked: usize,
    pub keys_deleted: usize,
    pub records_persisted: u64,
    pub records_failed: u64,
    pub elapsed_ms: u64,
}

impl CycleReport {
    fn record(&mut self, report: &KeyReport) {
        match &report.outcome {
            KeyOutcome::Skipped => self.keys_skipped += 1,
            KeyOutcome::Panicked => self.keys_panicked += 1,
            KeyOutcome::Drained(drain) => {
                if drain.halt.is_some() {
                    self.keys_halted += 1;
                } else {
                    self.keys_drained += 1;
                }
                self.records_persisted += drain.persisted;
                self.records_failed += drain.failed;
            }
        }
        if report.cleanup == Some(CleanupOutcome::Deleted) {
            self.keys_deleted += 1;
        }
    }
}

/// Outcome of one batch
struct BatchResult {
    succeeded: usize,
    failed: usize,
}

/// Moves queued telemetry from the source store into the sink
pub struct DrainEngine {
    store: Arc<dyn SourceStore>,
    sink: Arc<dyn SinkWriter>,
    codec: Arc<dyn RecordCodec>,
    settings: DrainSettings,
    /// Held for the duration of a cycle; cycles never overlap
    cycle_guard: Mutex<()>,
}

impl DrainEngine {
    pub fn new(
        store: Arc<dyn SourceStore>,
        sink: Arc<dyn SinkWriter>,
        codec: Arc<dyn RecordCodec>,
        settings: DrainSettings,
    ) -> Self {
        Self {
            store,
            sink,
            codec,
            settings,
            cycle_guard: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &DrainSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SourceStore> {
        &self.store
    }

    /// Run one drain cycle over every key in the store.
    ///
    /// Fails only when another cycle is in flight or key enumeration fails;
    /// everything that goes wrong on a single key is logged and reported.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let _guard = self.cycle_guard.try_lock().map_err(|_| {
            metrics::counter!("drain.cycles.skipped").increment(1);
            CycleError::AlreadyRunning
        })?;

        let started = Instant::now();

        let keys: BTreeSet<String> = self
            .store
            .scan_keys(&self.settings.key_pattern)
            .await
            .map_err(|e| {
                metrics::counter!("drain.store.errors").increment(1);
                metrics::counter!("drain.cycles.failed").increment(1);
                CycleError::Enumerate(e)
            })?
            .into_iter()
            .collect();

        if keys.is_empty() {
            debug!("No keys found in source store");
        }

        let mut report = CycleReport {
            keys_seen: keys.len(),
            ..Default::default()
        };

        let mut reports = futures::stream::iter(keys)
            .map(|key| self.process_key_guarded(key))
            .buffer_unordered(self.settings.key_concurrency.max(1));

        while let Some(key_report) = reports.next().await {
            report.record(&key_report);
        }

        let elapsed = started.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;

        metrics::counter!("drain.cycles.completed").increment(1);
        metrics::histogram!("drain.cycle.duration_seconds").record(elapsed.as_secs_f64());

        info!(
            keys_seen = report.keys_seen,
            keys_skipped = report.keys_skipped,
            keys_halted = report.keys_halted,
            keys_deleted = report.keys_deleted,
            records_persisted = report.records_persisted,
            records_failed = report.records_failed,
            elapsed_ms = report.elapsed_ms,
            "Drain cycle completed"
        );

        Ok(report)
    }

    /// Process one key, turning a panic into a `Panicked` outcome
    async fn process_key_guarded(&self, key: String) -> KeyReport {
        match AssertUnwindSafe(self.process_key(&key)).catch_unwind().await {
            Ok(report) => report,
            Err(_) => {
                error!(key = %key, "Unexpected panic while processing key");
                KeyReport {
                    key,
                    outcome: KeyOutcome::Panicked,
                    cleanup: None,
                }
            }
        }
    }

    /// Type-check, drain, and clean up a single key
    #[instrument(skip(self))]
    pub async fn process_key(&self, key: &str) -> KeyReport {
        match self.store.key_type(key).await {
            Ok(KeyType::List) => {}
            Ok(other) => {
                debug!(key = %key, key_type = ?other, "Skipping non-list key");
                return KeyReport {
                    key: key.to_string(),
                    outcome: KeyOutcome::Skipped,
                    cleanup: None,
                };
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Type check failed");
                metrics::counter!("drain.store.errors").increment(1);
                return KeyReport {
                    key: key.to_string(),
                    outcome: KeyOutcome::Skipped,
                    cleanup: None,
                };
            }
        }

        let drain = self.drain_key(key).await;

        let cleanup = if drain.persisted > 0 {
            Some(self.cleanup_if_empty(key).await)
        } else {
            None
        };

        KeyReport {
            key: key.to_string(),
            outcome: KeyOutcome::Drained(drain),
            cleanup,
        }
    }

    /// Drain a list head-first until it runs dry or a batch fails.
    ///
    /// The list is only ever trimmed past a batch whose every element was
    /// persisted.
    #[instrument(skip(self))]
    pub async fn drain_key(&self, key: &str) -> KeyDrain {
        let batch_size = self.settings.batch_size.max(1);
        let mut consecutive_empty: u32 = 0;
        let mut drain = KeyDrain {
            persisted: 0,
            failed: 0,
            halt: None,
        };

        while consecutive_empty < self.settings.max_consecutive_empty {
            let batch = match self.store.range(key, 0, batch_size as i64 - 1).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(key = %key, error = %e, "Batch retrieval failed");
                    metrics::counter!("drain.store.errors").increment(1);
                    Vec::new()
                }
            };

            if batch.is_empty() {
                consecutive_empty += 1;
                continue;
            }
            consecutive_empty = 0;

            let result = self.process_batch(key, &batch).await;
            drain.failed += result.failed as u64;

            if result.succeeded != batch.len() {
                warn!(
                    key = %key,
                    succeeded = result.succeeded,
                    batch_size = batch.len(),
                    "Partial batch, leaving it at the head for the next cycle"
                );
                metrics::counter!("drain.keys.halted").increment(1);
                drain.halt = Some(HaltReason::PartialBatch {
                    succeeded: result.succeeded,
                    batch_size: batch.len(),
                });
                break;
            }

            if let Err(e) = self.trim_processed(key, result.succeeded).await {
                error!(key = %key, error = %e, "Trim failed, batch will be re-delivered");
                metrics::counter!("drain.store.errors").increment(1);
                metrics::counter!("drain.keys.halted").increment(1);
                drain.halt = Some(HaltReason::TrimFailed);
                break;
            }

            drain.persisted += result.succeeded as u64;
            metrics::counter!("drain.batches.trimmed").increment(1);
        }

        debug!(key = %key, persisted = drain.persisted, "Key loop finished");
        drain
    }

    /// Drop the first `count` elements of the list
    async fn trim_processed(&self, key: &str, count: usize) -> Result<(), StoreError> {
        self.store.trim(key, count as i64, -1).await
    }

    /// Decode and persist every element of a batch, in order
    async fn process_batch(&self, key: &str, batch: &[Vec<u8>]) -> BatchResult {
        let mut records: Vec<TelemetryRecord> = Vec::with_capacity(batch.len());
        let mut failed = 0;

        for (position, payload) in batch.iter().enumerate() {
            match self.codec.decode(payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(key = %key, position, error = %e, "Telemetry decode error");
                    metrics::counter!("drain.records.decode_failed").increment(1);
                    failed += 1;
                }
            }
        }

        let outcomes = match self.settings.write_mode {
            WriteMode::Single => {
                let mut outcomes = Vec::with_capacity(records.len());
                for record in &records {
                    outcomes.push(self.sink.persist(record).await);
                }
                outcomes
            }
            WriteMode::Grouped => self.sink.persist_many(&records).await,
        };

        let mut succeeded = 0;
        for (record, outcome) in records.iter().zip(&outcomes) {
            match outcome {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    error!(
                        key = %key,
                        device_id = record.device_id,
                        fix_time = record.fix_time,
                        error = %e,
                        "Insertion error"
                    );
                    failed += 1;
                }
            }
        }
        // A sink that reports fewer outcomes than records leaves the rest unconfirmed.
        failed += records.len().saturating_sub(outcomes.len());

        metrics::counter!("drain.records.persisted").increment(succeeded as u64);
        metrics::counter!("drain.records.failed").increment(failed as u64);

        BatchResult { succeeded, failed }
    }

    /// Remove the key if it is empty, with a bounded number of attempts.
    ///
    /// Never deletes a key that still holds elements, and never touches a key
    /// that is already gone.
    #[instrument(skip(self))]
    pub async fn cleanup_if_empty(&self, key: &str) -> CleanupOutcome {
        let attempts = self.settings.max_delete_attempts;

        for attempt in 1..=attempts {
            let result = match self.store.size(key).await {
                Ok(None) => return CleanupOutcome::Absent,
                Ok(Some(0)) => self.store.delete(key).await,
                Ok(Some(size)) => {
                    debug!(key = %key, size, "Key not empty, preserving");
                    return CleanupOutcome::NotEmpty(size);
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    info!(key = %key, "Removed empty key");
                    metrics::counter!("drain.keys.deleted").increment(1);
                    return CleanupOutcome::Deleted;
                }
                Err(e) => {
                    warn!(key = %key, attempt, error = %e, "Delete attempt failed");
                    metrics::counter!("drain.store.errors").increment(1);
                }
            }
        }

        error!(key = %key, attempts, "Failed to delete key after all attempts");
        CleanupOutcome::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::record::JsonRecordCodec;
    use crate::sink::MockSinkWriter;
    use crate::source_store::MockSourceStore;
    use tokio_test::assert_ok;

    fn payload(device_id: i64, fix_time: i64) -> Vec<u8> {
        format!(r#"{{"deviceId": {}, "fixTime": {}}}"#, device_id, fix_time).into_bytes()
    }

    fn engine(store: MockSourceStore, sink: MockSinkWriter, write_mode: WriteMode) -> DrainEngine {
        DrainEngine::new(
            Arc::new(store),
            Arc::new(sink),
            Arc::new(JsonRecordCodec),
            DrainSettings {
                write_mode,
                ..Default::default()
            },
        )
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("connection reset".to_string())
    }

    #[tokio::test]
    async fn test_non_list_key_is_never_touched() {
        let mut store = MockSourceStore::new();
        store
            .expect_scan_keys()
            .times(1)
            .returning(|_| Ok(vec!["q3".to_string()]));
        store
            .expect_key_type()
            .times(1)
            .returning(|_| Ok(KeyType::Other("string".to_string())));
        store.expect_range().never();
        store.expect_trim().never();
        store.expect_size().never();
        store.expect_delete().never();

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        let report = assert_ok!(engine.run_cycle().await);

        assert_eq!(report.keys_seen, 1);
        assert_eq!(report.keys_skipped, 1);
        assert_eq!(report.records_persisted, 0);
    }

    #[tokio::test]
    async fn test_type_check_failure_skips_key() {
        let mut store = MockSourceStore::new();
        store.expect_key_type().returning(|_| Err(unavailable()));
        store.expect_range().never();

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        let report = engine.process_key("q1").await;

        assert_eq!(report.outcome, KeyOutcome::Skipped);
        assert!(report.cleanup.is_none());
    }

    #[tokio::test]
    async fn test_empty_key_stops_after_three_reads() {
        let mut store = MockSourceStore::new();
        store.expect_range().times(3).returning(|_, _, _| Ok(vec![]));
        store.expect_trim().never();

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        let drain = engine.drain_key("q1").await;

        assert_eq!(drain.persisted, 0);
        assert!(drain.halt.is_none());
    }

    #[tokio::test]
    async fn test_read_failures_count_as_empty_reads() {
        let mut store = MockSourceStore::new();
        store
            .expect_range()
            .times(3)
            .returning(|_, _, _| Err(unavailable()));
        store.expect_trim().never();

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        let drain = engine.drain_key("q1").await;

        assert_eq!(drain.persisted, 0);
    }

    #[tokio::test]
    async fn test_reads_batch_from_head_with_configured_size() {
        let mut store = MockSourceStore::new();
        let mut reads = 0;
        store
            .expect_range()
            .withf(|_, start, stop| *start == 0 && *stop == 99)
            .times(4)
            .returning(move |_, _, _| {
                reads += 1;
                if reads == 1 {
                    Ok(vec![payload(1, 1000), payload(1, 2000)])
                } else {
                    Ok(vec![])
                }
            });
        store
            .expect_trim()
            .withf(|_, start, stop| *start == 2 && *stop == -1)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut sink = MockSinkWriter::new();
        sink.expect_persist().times(2).returning(|_| Ok(()));

        let engine = engine(store, sink, WriteMode::Single);
        let drain = engine.drain_key("q1").await;

        assert_eq!(drain.persisted, 2);
        assert!(drain.halt.is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_halts_without_trim() {
        let mut store = MockSourceStore::new();
        store
            .expect_range()
            .times(1)
            .returning(|_, _, _| Ok(vec![payload(1, 1), payload(1, 2), payload(1, 3)]));
        store.expect_trim().never();

        let mut sink = MockSinkWriter::new();
        sink.expect_persist().times(3).returning(|record| {
            if record.fix_time == 2 {
                Err(SinkError::Rejected {
                    code: 500,
                    message: "storage engine read-only".to_string(),
                })
            } else {
                Ok(())
            }
        });

        let engine = engine(store, sink, WriteMode::Single);
        let drain = engine.drain_key("q1").await;

        assert_eq!(drain.persisted, 0);
        assert_eq!(drain.failed, 1);
        assert_eq!(
            drain.halt,
            Some(HaltReason::PartialBatch {
                succeeded: 2,
                batch_size: 3
            })
        );
    }

    #[tokio::test]
    async fn test_grouped_mode_uses_persist_many() {
        let mut store = MockSourceStore::new();
        store
            .expect_range()
            .times(1)
            .returning(|_, _, _| Ok(vec![payload(1, 1), payload(2, 2)]));
        store.expect_trim().never();

        let mut sink = MockSinkWriter::new();
        sink.expect_persist().never();
        sink.expect_persist_many()
            .times(1)
            .returning(|records| {
                records
                    .iter()
                    .map(|r| {
                        if r.device_id == 2 {
                            Err(SinkError::Unwritable("device group failed".to_string()))
                        } else {
                            Ok(())
                        }
                    })
                    .collect()
            });

        let engine = engine(store, sink, WriteMode::Grouped);
        let drain = engine.drain_key("q1").await;

        assert_eq!(drain.failed, 1);
        assert!(matches!(drain.halt, Some(HaltReason::PartialBatch { .. })));
    }

    #[tokio::test]
    async fn test_short_outcome_list_is_not_trusted() {
        let mut store = MockSourceStore::new();
        store
            .expect_range()
            .times(1)
            .returning(|_, _, _| Ok(vec![payload(1, 1), payload(1, 2)]));
        store.expect_trim().never();

        let mut sink = MockSinkWriter::new();
        sink.expect_persist_many().returning(|_| vec![Ok(())]);

        let engine = engine(store, sink, WriteMode::Grouped);
        let drain = engine.drain_key("q1").await;

        assert_eq!(drain.failed, 1);
        assert!(drain.halt.is_some());
    }

    #[tokio::test]
    async fn test_trim_failure_halts_key() {
        let mut store = MockSourceStore::new();
        store
            .expect_range()
            .times(1)
            .returning(|_, _, _| Ok(vec![payload(1, 1)]));
        store
            .expect_trim()
            .times(1)
            .returning(|_, _, _| Err(unavailable()));

        let mut sink = MockSinkWriter::new();
        sink.expect_persist().times(1).returning(|_| Ok(()));

        let engine = engine(store, sink, WriteMode::Single);
        let drain = engine.drain_key("q1").await;

        assert_eq!(drain.persisted, 0);
        assert_eq!(drain.halt, Some(HaltReason::TrimFailed));
    }

    #[tokio::test]
    async fn test_cleanup_absent_key_does_nothing() {
        let mut store = MockSourceStore::new();
        store.expect_size().times(1).returning(|_| Ok(None));
        store.expect_delete().never();

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        assert_eq!(engine.cleanup_if_empty("q1").await, CleanupOutcome::Absent);
    }

    #[tokio::test]
    async fn test_cleanup_never_deletes_non_empty_key() {
        let mut store = MockSourceStore::new();
        store.expect_size().times(1).returning(|_| Ok(Some(4)));
        store.expect_delete().never();

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        assert_eq!(
            engine.cleanup_if_empty("q1").await,
            CleanupOutcome::NotEmpty(4)
        );
    }

    #[tokio::test]
    async fn test_cleanup_deletes_empty_key() {
        let mut store = MockSourceStore::new();
        store.expect_size().times(1).returning(|_| Ok(Some(0)));
        store.expect_delete().times(1).returning(|_| Ok(()));

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        assert_eq!(engine.cleanup_if_empty("q1").await, CleanupOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_cleanup_gives_up_after_three_attempts() {
        let mut store = MockSourceStore::new();
        store.expect_size().times(3).returning(|_| Err(unavailable()));
        store.expect_delete().never();

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        assert_eq!(
            engine.cleanup_if_empty("q1").await,
            CleanupOutcome::Exhausted
        );
    }

    #[tokio::test]
    async fn test_cleanup_retries_failed_delete() {
        let mut store = MockSourceStore::new();
        store.expect_size().times(2).returning(|_| Ok(Some(0)));
        let mut deletes = 0;
        store.expect_delete().times(2).returning(move |_| {
            deletes += 1;
            if deletes == 1 {
                Err(unavailable())
            } else {
                Ok(())
            }
        });

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        assert_eq!(engine.cleanup_if_empty("q1").await, CleanupOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_enumeration_failure_ends_cycle() {
        let mut store = MockSourceStore::new();
        store
            .expect_scan_keys()
            .times(1)
            .returning(|_| Err(unavailable()));
        store.expect_key_type().never();

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);

        assert!(matches!(
            engine.run_cycle().await,
            Err(CycleError::Enumerate(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_scan_results_are_processed_once() {
        let mut store = MockSourceStore::new();
        store
            .expect_scan_keys()
            .returning(|_| Ok(vec!["q1".to_string(), "q1".to_string()]));
        store.expect_key_type().times(1).returning(|_| Ok(KeyType::Absent));

        let engine = engine(store, MockSinkWriter::new(), WriteMode::Single);
        let report = assert_ok!(engine.run_cycle().await);

        assert_eq!(report.keys_seen, 1);
    }
}
