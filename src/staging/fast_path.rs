//! Specimen fast path
//!
//! Specimens skip aggregation: each admitted record is queued for a pool of
//! upload workers right away. The queue and the pool are bounded; a job that
//! does not fit stays in Incoming and is picked up by the next
//! reconciliation pass.

use super::config::FastPathConfig;
use super::error::PipelineResult;
use super::kind::{RecordKind, Stage};
use super::stage_store::{RecordHandle, StageStore};
use super::uploader::Uploader;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One queued delivery
#[derive(Debug, Clone)]
pub struct SpecimenJob {
    pub handle: RecordHandle,
    pub owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue at capacity; left for reconciliation
    Full,
    /// Pool already shut down; left for reconciliation
    Closed,
}

/// Counts from a specimen recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecimenRecovery {
    pub delivered: usize,
    pub failed: usize,
}

/// Promote, upload and finalize one specimen record
///
/// A malformed name is left where it is. A failed upload leaves the record
/// in Uploading.
pub async fn deliver_specimen(
    store: &StageStore,
    uploader: &Uploader,
    handle: &RecordHandle,
    owner: &str,
) -> PipelineResult<String> {
    let specimen = store.decode_specimen_name(handle)?;
    let handle = match handle.stage() {
        Stage::Uploading => handle.clone(),
        _ => store.promote_single(handle, Stage::Uploading)?,
    };

    let body = store.open_reader(&handle)?;
    let key = uploader.upload_specimen(owner, &specimen, body).await?;
    store.finalize(&handle)?;
    Ok(key)
}

/// Deliver every specimen left in Uploading or Incoming
///
/// The owner comes from the index when it is still known in this process,
/// else `fallback_owner`.
pub async fn recover_specimens(
    store: &StageStore,
    uploader: &Uploader,
    fallback_owner: &str,
) -> PipelineResult<SpecimenRecovery> {
    let mut recovery = SpecimenRecovery::default();

    for stage in [Stage::Uploading, Stage::Incoming] {
        for handle in store.list(RecordKind::Specimen, stage)? {
            let owner = store
                .owner_of(&handle)
                .unwrap_or_else(|| fallback_owner.to_string());
            match deliver_specimen(store, uploader, &handle, &owner).await {
                Ok(key) => {
                    debug!(file = %handle.name(), key = %key, owner = %owner, "Recovered specimen");
                    recovery.delivered += 1;
                }
                Err(e) => {
                    warn!(file = %handle.name(), stage = %stage, error = %e, "Specimen recovery failed");
                    recovery.failed += 1;
                }
            }
        }
    }

    if recovery.delivered + recovery.failed > 0 {
        info!(
            delivered = recovery.delivered,
            failed = recovery.failed,
            "Specimen recovery finished"
        );
    }
    Ok(recovery)
}

/// Handle to the specimen upload pool
pub struct FastPathHandle {
    tx: Mutex<Option<mpsc::Sender<SpecimenJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FastPathHandle {
    /// Queue a delivery without waiting
    pub fn enqueue(&self, job: SpecimenJob) -> EnqueueOutcome {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            debug!(file = %job.handle.name(), "Fast path closed; left for reconciliation");
            return EnqueueOutcome::Closed;
        };
        match tx.try_send(job) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(job)) => {
                warn!(file = %job.handle.name(), "Fast path queue full; left for reconciliation");
                EnqueueOutcome::Full
            }
            Err(TrySendError::Closed(job)) => {
                debug!(file = %job.handle.name(), "Fast path closed; left for reconciliation");
                EnqueueOutcome::Closed
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stop accepting jobs, let workers finish the queue, and join them
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Fast path worker panicked");
            }
        }
    }
}

/// Spawn the specimen upload pool
pub fn spawn_fast_path(
    store: Arc<StageStore>,
    uploader: Arc<Uploader>,
    config: &FastPathConfig,
) -> FastPathHandle {
    let (tx, rx) = mpsc::channel::<SpecimenJob>(config.queue_capacity.max(1));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let workers = (0..config.workers.max(1))
        .map(|worker| {
            let rx = rx.clone();
            let store = store.clone();
            let uploader = uploader.clone();
            tokio::spawn(async move {
                loop {
                    // Lock released before the upload so other workers can pull
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };

                    match deliver_specimen(&store, &uploader, &job.handle, &job.owner).await {
                        Ok(key) => debug!(worker, key = %key, "Specimen delivered"),
                        Err(e) => warn!(
                            worker,
                            file = %job.handle.name(),
                            error = %e,
                            "Specimen delivery failed; left for reconciliation"
                        ),
                    }
                }
            })
        })
        .collect();

    FastPathHandle {
        tx: Mutex::new(Some(tx)),
        workers: Mutex::new(workers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::clock::SimulatedClock;
    use crate::staging::config::BucketsConfig;
    use crate::staging::naming::MonotonicIdSource;
    use crate::staging::object_store::InMemoryObjectStore;
    use crate::staging::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig};
    use crate::staging::stage_store::StageStoreOptions;
    use tempfile::TempDir;

    fn setup() -> (
        TempDir,
        Arc<StageStore>,
        SimulatedObjectStore<InMemoryObjectStore>,
        Arc<Uploader>,
    ) {
        let dir = TempDir::new().unwrap();
        let clock = SimulatedClock::from_nanos(1_700_000_000_123_456_000);
        let store = Arc::new(
            StageStore::open(
                dir.path(),
                StageStoreOptions {
                    clock: Arc::new(clock.clone()),
                    ids: Arc::new(MonotonicIdSource::starting_at(10)),
                    fsync: false,
                },
            )
            .unwrap(),
        );
        let objects =
            SimulatedObjectStore::new(InMemoryObjectStore::new(), 3, SimulatedStoreConfig::no_faults());
        let uploader = Arc::new(Uploader::new(
            Arc::new(objects.clone()),
            BucketsConfig::test(),
            Arc::new(clock),
        ));
        (dir, store, objects, uploader)
    }

    #[tokio::test]
    async fn test_deliver_specimen_uploads_and_finalizes() {
        let (_dir, store, objects, uploader) = setup();
        let handle = store
            .admit_specimen("alice", "http://example.com/test file.png", b"abc")
            .unwrap();

        let key = deliver_specimen(&store, &uploader, &handle, "alice").await.unwrap();
        assert!(key.starts_with("alice/2023/11/14/test_file."));
        assert!(key.ends_with(".png"));

        let object = objects.inner().get("specimen", &key).unwrap();
        assert_eq!(object.data, b"abc");
        assert_eq!(object.options.metadata["uri"], "http://example.com/test file.png");
        assert_eq!(store.count(RecordKind::Specimen, Stage::Incoming), 0);
        assert_eq!(store.count(RecordKind::Specimen, Stage::Uploading), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_stays_in_uploading_then_recovers() {
        let (_dir, store, objects, uploader) = setup();
        let handle = store.admit_specimen("bob", "http://x/shot.jpg", b"j").unwrap();
        objects.fail_next_puts(1);

        assert!(deliver_specimen(&store, &uploader, &handle, "bob").await.is_err());
        assert_eq!(store.count(RecordKind::Specimen, Stage::Uploading), 1);

        let recovery = recover_specimens(&store, &uploader, "unknown").await.unwrap();
        assert_eq!(recovery, SpecimenRecovery { delivered: 1, failed: 0 });

        // Same process: the indexed owner is used, not the placeholder
        let history = objects.inner().history();
        assert_eq!(history.len(), 1);
        assert!(history[0].key.starts_with("bob/"));
    }

    #[tokio::test]
    async fn test_recovery_after_restart_uses_fallback_owner() {
        let (dir, store, objects, uploader) = setup();
        store.admit_specimen("carol", "http://x/a.txt", b"t").unwrap();
        drop(store);

        let reopened = StageStore::open(dir.path(), StageStoreOptions::default()).unwrap();
        let recovery = recover_specimens(&reopened, &uploader, "unknown").await.unwrap();
        assert_eq!(recovery.delivered, 1);

        let history = objects.inner().history();
        assert!(history[0].key.starts_with("unknown/"));
        assert_eq!(history[0].object.options.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_pool_delivers_and_close_drains_queue() {
        let (_dir, store, objects, uploader) = setup();
        let pool = spawn_fast_path(store.clone(), uploader, &FastPathConfig::test());

        for i in 0..5 {
            let uri = format!("http://x/{}.png", i);
            let handle = store.admit_specimen("alice", &uri, b"p").unwrap();
            let outcome = pool.enqueue(SpecimenJob {
                handle,
                owner: "alice".to_string(),
            });
            assert_eq!(outcome, EnqueueOutcome::Queued);
        }

        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(objects.inner().history().len(), 5);
        assert_eq!(store.count(RecordKind::Specimen, Stage::Incoming), 0);

        let handle = store.admit_specimen("alice", "http://x/late.png", b"p").unwrap();
        let outcome = pool.enqueue(SpecimenJob {
            handle,
            owner: "alice".to_string(),
        });
        assert_eq!(outcome, EnqueueOutcome::Closed);
        assert_eq!(store.count(RecordKind::Specimen, Stage::Incoming), 1);
    }
}
