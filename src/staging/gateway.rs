//! Gateway
//!
//! Wires the stage store, uploader, aggregator, specimen pool and drain
//! controller together. Startup runs one reconciliation pass before any
//! periodic work begins.
//!
//! ```text
//! admit ──► StageStore ──► Incoming
//!                │
//!                ├─ usage/error ──► periodic Aggregator ──► Uploader
//!                └─ specimen ─────► fast path pool ───────► Uploader
//! ```

use super::aggregator::Aggregator;
use super::clock::{Clock, SystemClock};
use super::config::GatewayConfig;
use super::drain::{DrainController, DrainOutcome, DrainState};
use super::error::PipelineResult;
use super::fast_path::{spawn_fast_path, FastPathHandle, SpecimenJob};
use super::kind::RecordKind;
use super::naming::UniqueIdSource;
use super::object_store::ObjectStore;
use super::reconcile::{ReconcileReport, Reconciler};
use super::stage_store::{RecordHandle, StageStore, StageStoreOptions};
use super::uploader::Uploader;
use super::worker::spawn_aggregation_worker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Boundary the request-facing layer admits records through
pub trait Producer: Send + Sync {
    /// Stage one record; only local disk-write failures are reported
    fn admit(&self, kind: RecordKind, owner: &str, payload: &[u8]) -> PipelineResult<()>;
}

impl Producer for StageStore {
    fn admit(&self, kind: RecordKind, owner: &str, payload: &[u8]) -> PipelineResult<()> {
        StageStore::admit(self, kind, owner, payload).map(|_| ())
    }
}

pub struct Gateway {
    config: GatewayConfig,
    store: Arc<StageStore>,
    uploader: Arc<Uploader>,
    reconciler: Arc<Reconciler>,
    fast_path: Arc<FastPathHandle>,
    drain: DrainController,
}

impl Gateway {
    /// Start with the system clock and the configured id source
    pub async fn start(config: GatewayConfig, objects: Arc<dyn ObjectStore>) -> PipelineResult<Self> {
        let ids = config.staging.id_source.build();
        Self::start_with(config, objects, Arc::new(SystemClock), ids).await
    }

    pub async fn start_with(
        config: GatewayConfig,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn UniqueIdSource>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let store = Arc::new(StageStore::open(
            &config.cache_dir,
            StageStoreOptions {
                clock: clock.clone(),
                ids,
                fsync: config.staging.fsync,
            },
        )?);
        let uploader = Arc::new(Uploader::new(objects, config.buckets.clone(), clock));
        let aggregator = Arc::new(Aggregator::new(store.clone(), uploader.clone()));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            uploader.clone(),
            aggregator.clone(),
            config.fast_path.fallback_owner.clone(),
        ));

        let startup = reconciler.process_remaining().await;
        info!(
            uploaded_artifacts = startup.uploaded_artifacts,
            delivered_specimens = startup.delivered_specimens,
            clean = startup.is_clean(),
            "Startup reconciliation finished"
        );

        let shutdown = CancellationToken::new();
        let workers = RecordKind::BATCHED
            .into_iter()
            .map(|kind| {
                spawn_aggregation_worker(
                    kind,
                    config.aggregation.interval(kind),
                    aggregator.clone(),
                    shutdown.clone(),
                )
            })
            .collect();
        let fast_path = Arc::new(spawn_fast_path(store.clone(), uploader.clone(), &config.fast_path));
        let drain = DrainController::new(shutdown, workers, fast_path.clone(), reconciler.clone());

        info!(
            cache_dir = %config.cache_dir.display(),
            hostname = %uploader.hostname(),
            "Gateway started"
        );
        Ok(Gateway {
            config,
            store,
            uploader,
            reconciler,
            fast_path,
            drain,
        })
    }

    /// Stage a record
    ///
    /// For specimens `subject` is the source URI and the configured fallback
    /// owner is used; prefer [`Gateway::admit_specimen`].
    pub fn admit(&self, kind: RecordKind, subject: &str, payload: &[u8]) -> PipelineResult<RecordHandle> {
        match kind {
            RecordKind::Specimen => {
                let owner = self.config.fast_path.fallback_owner.clone();
                self.admit_specimen(&owner, subject, payload)
            }
            _ => self.store.admit(kind, subject, payload),
        }
    }

    /// Stage a specimen and queue it for immediate delivery
    pub fn admit_specimen(&self, owner: &str, uri: &str, payload: &[u8]) -> PipelineResult<RecordHandle> {
        let handle = self.store.admit_specimen(owner, uri, payload)?;
        // Not queued means the record waits for the next reconciliation pass
        self.fast_path.enqueue(SpecimenJob {
            handle: handle.clone(),
            owner: owner.to_string(),
        });
        Ok(handle)
    }

    /// Run a reconciliation pass now (safe while workers run)
    pub async fn process_remaining(&self) -> ReconcileReport {
        self.reconciler.process_remaining().await
    }

    pub async fn drain(&self) -> DrainOutcome {
        self.drain.drain().await
    }

    pub async fn wait_finished(&self) {
        self.drain.wait_finished().await
    }

    pub fn state(&self) -> DrainState {
        self.drain.state()
    }

    pub fn store(&self) -> &Arc<StageStore> {
        &self.store
    }

    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

impl Producer for Gateway {
    fn admit(&self, kind: RecordKind, owner: &str, payload: &[u8]) -> PipelineResult<()> {
        Gateway::admit(self, kind, owner, payload).map(|_| ())
    }
}
