use crate::engine::DrainEngine;
use crate::error::CycleError;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drives the drain engine with a fixed delay between cycles.
///
/// The first cycle starts immediately. Cancellation is only observed while
/// waiting, so a cycle that has started always runs to completion. A cycle
/// that panics is logged and the loop carries on.
pub struct DrainScheduler {
    engine: Arc<DrainEngine>,
    delay: Duration,
    shutdown: CancellationToken,
}

impl DrainScheduler {
    pub fn new(engine: Arc<DrainEngine>, delay: Duration, shutdown: CancellationToken) -> Self {
        Self {
            engine,
            delay,
            shutdown,
        }
    }

    /// Spawn the scheduling loop on the runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run cycles until the shutdown token is cancelled
    pub async fn run(self) {
        info!(delay_secs = self.delay.as_secs(), "Drain scheduler started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match AssertUnwindSafe(self.engine.run_cycle()).catch_unwind().await {
                Ok(Ok(_)) => {}
                Ok(Err(CycleError::AlreadyRunning)) => {
                    warn!("Previous drain cycle still running, skipping this tick");
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Drain cycle failed");
                }
                Err(_) => {
                    metrics::counter!("drain.cycles.failed").increment(1);
                    error!("Drain cycle panicked, waiting for the next tick");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        info!("Drain scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DrainSettings;
    use crate::record::JsonRecordCodec;
    use crate::sink::MockSinkWriter;
    use crate::error::StoreError;
    use crate::source_store::{KeyType, MockSourceStore, SourceStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_engine(cycles: Arc<AtomicUsize>) -> Arc<DrainEngine> {
        let mut store = MockSourceStore::new();
        store.expect_scan_keys().returning(move |_| {
            cycles.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        });

        Arc::new(DrainEngine::new(
            Arc::new(store),
            Arc::new(MockSinkWriter::new()),
            Arc::new(JsonRecordCodec),
            DrainSettings::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_after_each_delay() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let handle = DrainScheduler::new(
            counting_engine(cycles.clone()),
            Duration::from_secs(60),
            shutdown.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cycles.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cycles.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    /// Store whose first enumeration panics
    struct PanicOnceStore {
        scans: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceStore for PanicOnceStore {
        async fn scan_keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
            if self.scans.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("connection state corrupted");
            }
            Ok(vec![])
        }

        async fn key_type(&self, _key: &str) -> Result<KeyType, StoreError> {
            Ok(KeyType::Absent)
        }

        async fn range(&self, _key: &str, _start: i64, _stop: i64) -> Result<Vec<Vec<u8>>, StoreError> {
            Ok(vec![])
        }

        async fn trim(&self, _key: &str, _start: i64, _stop: i64) -> Result<(), StoreError> {
            Ok(())
        }

        async fn size(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            Ok(None)
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_does_not_stop_scheduler() {
        let scans = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(DrainEngine::new(
            Arc::new(PanicOnceStore {
                scans: scans.clone(),
            }),
            Arc::new(MockSinkWriter::new()),
            Arc::new(JsonRecordCodec),
            DrainSettings::default(),
        ));
        let shutdown = CancellationToken::new();
        let handle =
            DrainScheduler::new(engine.clone(), Duration::from_secs(60), shutdown.clone()).spawn();

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!handle.is_finished());
        assert_eq!(scans.load(Ordering::SeqCst), 4);

        // The guard was released by the unwinding cycle
        assert!(engine.run_cycle().await.is_ok());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_without_another_cycle() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let handle = DrainScheduler::new(
            counting_engine(cycles.clone()),
            Duration::from_secs(60),
            shutdown.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }
}
