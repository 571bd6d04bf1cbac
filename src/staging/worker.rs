//! Periodic aggregation workers, one per batched kind

use super::aggregator::{Aggregator, CycleOutcome, CycleTrigger};
use super::kind::RecordKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run an aggregation cycle for `kind` every `period` until `shutdown` fires
///
/// Cancellation is observed between ticks only; a running cycle always
/// completes before the task returns.
pub fn spawn_aggregation_worker(
    kind: RecordKind,
    period: Duration,
    aggregator: Arc<Aggregator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    debug_assert!(kind.is_batched(), "{} has no aggregation worker", kind);
    debug_assert!(!period.is_zero(), "aggregation period must be positive");

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(kind = %kind, period_secs = period.as_secs_f64(), "Aggregation worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match aggregator.run_cycle(kind, CycleTrigger::Tick).await {
                Ok(CycleOutcome::Uploaded { key, records }) => {
                    debug!(kind = %kind, key = %key, records, "Periodic cycle uploaded");
                }
                Ok(_) => {}
                Err(e) => warn!(kind = %kind, error = %e, "Periodic cycle failed; retrying next tick"),
            }
        }

        info!(kind = %kind, "Aggregation worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::clock::SimulatedClock;
    use crate::staging::config::BucketsConfig;
    use crate::staging::kind::Stage;
    use crate::staging::naming::MonotonicIdSource;
    use crate::staging::object_store::InMemoryObjectStore;
    use crate::staging::stage_store::{StageStore, StageStoreOptions};
    use crate::staging::uploader::Uploader;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_worker_ticks_and_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let clock = SimulatedClock::from_nanos(1_700_000_000_000_000_000);
        let store = Arc::new(
            StageStore::open(
                dir.path(),
                StageStoreOptions {
                    clock: Arc::new(clock.clone()),
                    ids: Arc::new(MonotonicIdSource::starting_at(1)),
                    fsync: false,
                },
            )
            .unwrap(),
        );
        let objects = InMemoryObjectStore::new();
        let uploader = Arc::new(Uploader::new(
            Arc::new(objects.clone()),
            BucketsConfig::test(),
            Arc::new(clock),
        ));
        let aggregator = Arc::new(Aggregator::new(store.clone(), uploader));
        let shutdown = CancellationToken::new();

        store.admit(RecordKind::Usage, "alice", b"{}").unwrap();
        let worker = spawn_aggregation_worker(
            RecordKind::Usage,
            Duration::from_millis(50),
            aggregator,
            shutdown.clone(),
        );

        for _ in 0..200 {
            if !objects.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(objects.len(), 1);
        assert_eq!(store.count(RecordKind::Usage, Stage::Incoming), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker must stop after cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_first_tick() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StageStore::open(dir.path(), StageStoreOptions::default()).unwrap());
        let objects = InMemoryObjectStore::new();
        let uploader = Arc::new(Uploader::new(
            Arc::new(objects.clone()),
            BucketsConfig::test(),
            Arc::new(SimulatedClock::from_nanos(0)),
        ));
        let aggregator = Arc::new(Aggregator::new(store.clone(), uploader));
        let shutdown = CancellationToken::new();
        store.admit(RecordKind::Error, "alice", b"{}").unwrap();

        let worker = spawn_aggregation_worker(
            RecordKind::Error,
            Duration::from_secs(3600),
            aggregator,
            shutdown.clone(),
        );
        shutdown.cancel();
        worker.await.unwrap();

        assert!(objects.is_empty());
        assert_eq!(store.count(RecordKind::Error, Stage::Incoming), 1);
    }
}
