//! Aggregator
//!
//! Per batched kind, one cycle runs `Idle -> Collecting -> Compressing ->
//! Uploading -> Idle`:
//!
//! 1. List Incoming. A periodic tick with nothing new is a no-op.
//! 2. Promote the listed records to Aggregating. From here on they are the
//!    unit of work; new admissions cannot race into the batch.
//! 3. Re-list Aggregating (including leftovers of an interrupted cycle),
//!    minus records already claimed by an undelivered artifact.
//! 4. Gzip the records in name order, one record per line.
//! 5. Promote the artifact to Uploading and write its source manifest.
//! 6. Upload. On success delete artifact, sources and manifest in that
//!    order. On failure keep everything; the next reconciliation pass
//!    retries the same artifact.
//!
//! Cycles of the same kind never overlap: the periodic worker and the
//! reconciliation pass share a per-kind async lock.

use super::error::{PipelineError, PipelineResult};
use super::kind::{RecordKind, Stage};
use super::manifest::ArtifactManifest;
use super::naming;
use super::stage_store::{RecordHandle, StageStore};
use super::uploader::Uploader;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    /// Periodic timer; empty Incoming means nothing to do
    Tick,
    /// Startup/shutdown reconciliation; also drains Aggregating leftovers
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Tick with an empty Incoming stage
    Idle,
    /// Nothing aggregatable was found
    Empty,
    Uploaded { key: String, records: usize },
}

/// Result of re-attempting artifacts already in Uploading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub uploaded: usize,
    pub failed: usize,
    /// Sources released by manifests whose artifact was already delivered
    pub orphan_sources_finalized: usize,
    /// Manifests that could not be parsed; left in Uploading for inspection
    pub unreadable_manifests: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemainingReport {
    pub retry: RetryReport,
    pub cycle: CycleOutcome,
}

pub struct Aggregator {
    store: Arc<StageStore>,
    uploader: Arc<Uploader>,
    usage_cycle: Mutex<()>,
    error_cycle: Mutex<()>,
}

impl Aggregator {
    pub fn new(store: Arc<StageStore>, uploader: Arc<Uploader>) -> Self {
        Aggregator {
            store,
            uploader,
            usage_cycle: Mutex::new(()),
            error_cycle: Mutex::new(()),
        }
    }

    async fn cycle_lock(&self, kind: RecordKind) -> PipelineResult<MutexGuard<'_, ()>> {
        match kind {
            RecordKind::Usage => Ok(self.usage_cycle.lock().await),
            RecordKind::Error => Ok(self.error_cycle.lock().await),
            RecordKind::Specimen => Err(PipelineError::InvalidStage {
                kind,
                stage: Stage::Aggregating,
            }),
        }
    }

    /// Run one aggregation cycle for a batched kind
    pub async fn run_cycle(&self, kind: RecordKind, trigger: CycleTrigger) -> PipelineResult<CycleOutcome> {
        let _cycle = self.cycle_lock(kind).await?;
        self.run_cycle_locked(kind, trigger).await
    }

    /// Retry artifacts in Uploading, then run a reconciliation cycle
    pub async fn process_remaining(&self, kind: RecordKind) -> PipelineResult<RemainingReport> {
        let _cycle = self.cycle_lock(kind).await?;
        let retry = self.retry_uploading_locked(kind).await?;
        let cycle = self.run_cycle_locked(kind, CycleTrigger::Reconcile).await?;
        Ok(RemainingReport { retry, cycle })
    }

    /// Re-attempt upload of every artifact already in Uploading
    pub async fn retry_uploading(&self, kind: RecordKind) -> PipelineResult<RetryReport> {
        let _cycle = self.cycle_lock(kind).await?;
        self.retry_uploading_locked(kind).await
    }

    async fn upload_artifact(&self, kind: RecordKind, artifact: &RecordHandle) -> PipelineResult<String> {
        let body = self.store.open_reader(artifact)?;
        self.uploader.upload_aggregate(kind, body).await
    }

    async fn run_cycle_locked(&self, kind: RecordKind, trigger: CycleTrigger) -> PipelineResult<CycleOutcome> {
        // Collecting
        let incoming = self.store.list(kind, Stage::Incoming)?;
        if incoming.is_empty() && trigger == CycleTrigger::Tick {
            return Ok(CycleOutcome::Idle);
        }
        if !incoming.is_empty() {
            let promoted = self.store.promote(kind, &incoming, Stage::Aggregating)?;
            debug!(
                kind = %kind,
                moved = promoted.moved.len(),
                failed = promoted.failed.len(),
                "Promoted incoming records"
            );
        }

        self.remove_stale_artifacts(kind)?;
        let claimed = self.claimed_sources(kind)?;
        let sources: Vec<RecordHandle> = self
            .store
            .list(kind, Stage::Aggregating)?
            .into_iter()
            .filter(|h| !claimed.contains(h.name()))
            .filter(|h| match naming::decode_batched_name(h.name()) {
                Ok(_) => true,
                Err(e) => {
                    warn!(kind = %kind, file = %h.name(), error = %e, "Skipping malformed record");
                    false
                }
            })
            .collect();
        debug_assert!(
            sources.windows(2).all(|w| w[0].name() < w[1].name()),
            "aggregation sources must be in name order"
        );
        if sources.is_empty() {
            return Ok(CycleOutcome::Empty);
        }

        // Compressing
        let (artifact, file) = self.store.create_artifact(kind)?;
        let inputs: Vec<(String, PathBuf)> = sources
            .iter()
            .map(|h| (h.name().to_string(), h.path().to_path_buf()))
            .collect();
        let compressed = tokio::task::spawn_blocking(move || compress_into_file(file, inputs))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
            .and_then(|r| r);
        let included = match compressed {
            Ok(included) if !included.is_empty() => included,
            Ok(_) => {
                self.store.finalize(&artifact)?;
                return Ok(CycleOutcome::Empty);
            }
            Err(e) => {
                let _ = self.store.finalize(&artifact);
                return Err(e.into());
            }
        };

        // Uploading
        let artifact = self.store.promote_single(&artifact, Stage::Uploading)?;
        let manifest = ArtifactManifest::new(
            kind,
            artifact.name().to_string(),
            included,
            self.store.clock().now(),
        );
        let manifest_handle = match self.store.write_manifest(&manifest) {
            Ok(handle) => handle,
            Err(e) => {
                // Sources are still unclaimed in Aggregating; the next cycle rebuilds
                let _ = self.store.finalize(&artifact);
                return Err(e);
            }
        };

        let records = manifest.sources.len();
        match self.upload_artifact(kind, &artifact).await {
            Ok(key) => {
                self.release(kind, &artifact, &manifest_handle, &manifest);
                info!(kind = %kind, records, key = %key, "Aggregation cycle uploaded");
                Ok(CycleOutcome::Uploaded { key, records })
            }
            Err(e) => {
                warn!(
                    kind = %kind,
                    artifact = %artifact.name(),
                    records,
                    error = %e,
                    "Upload failed; artifact kept for retry"
                );
                Err(e)
            }
        }
    }

    async fn retry_uploading_locked(&self, kind: RecordKind) -> PipelineResult<RetryReport> {
        let mut report = RetryReport::default();
        let artifacts = self.store.list_artifacts(kind, Stage::Uploading)?;
        let artifact_names: HashSet<&str> = artifacts.iter().map(|h| h.name()).collect();

        for artifact in &artifacts {
            let manifest_handle = self.store.entry(
                kind,
                Stage::Uploading,
                &naming::manifest_name_for(artifact.name()),
            )?;
            let manifest = match self.store.read_manifest(&manifest_handle) {
                Ok(m) => Some(m),
                Err(PipelineError::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => {
                    // Its sources are unclaimed and get aggregated again
                    warn!(kind = %kind, artifact = %artifact.name(), error = %e, "Unreadable manifest");
                    report.unreadable_manifests += 1;
                    None
                }
            };

            match self.upload_artifact(kind, artifact).await {
                Ok(key) => {
                    match &manifest {
                        Some(m) => self.release(kind, artifact, &manifest_handle, m),
                        None => {
                            if let Err(e) = self.store.finalize(artifact) {
                                warn!(kind = %kind, artifact = %artifact.name(), error = %e, "Finalize failed");
                            }
                        }
                    }
                    info!(kind = %kind, key = %key, artifact = %artifact.name(), "Retried upload succeeded");
                    report.uploaded += 1;
                }
                Err(e) => {
                    warn!(kind = %kind, artifact = %artifact.name(), error = %e, "Retried upload failed");
                    report.failed += 1;
                }
            }
        }

        // Manifest without artifact: delivered before a crash, only cleanup is left
        for manifest_handle in self.store.list_manifests(kind, Stage::Uploading)? {
            let artifact_name = naming::artifact_name_for(manifest_handle.name());
            if artifact_names.contains(artifact_name.as_str()) {
                continue;
            }
            match self.store.read_manifest(&manifest_handle) {
                Ok(manifest) => {
                    report.orphan_sources_finalized += self.finalize_sources(kind, &manifest);
                    self.store.finalize(&manifest_handle)?;
                }
                Err(e) => {
                    warn!(kind = %kind, manifest = %manifest_handle.name(), error = %e, "Unreadable orphan manifest left in place");
                    report.unreadable_manifests += 1;
                }
            }
        }

        Ok(report)
    }

    /// Delete aggregates left in Aggregating by a crash mid-compression
    fn remove_stale_artifacts(&self, kind: RecordKind) -> PipelineResult<()> {
        let stale = self.store.list_artifacts(kind, Stage::Aggregating)?;
        for handle in stale
            .into_iter()
            .chain(self.store.list_manifests(kind, Stage::Aggregating)?)
        {
            debug!(kind = %kind, file = %handle.name(), "Removing stale artifact");
            self.store.finalize(&handle)?;
        }
        Ok(())
    }

    /// Sources consumed by artifacts still waiting in Uploading
    fn claimed_sources(&self, kind: RecordKind) -> PipelineResult<HashSet<String>> {
        let mut claimed = HashSet::new();
        for manifest_handle in self.store.list_manifests(kind, Stage::Uploading)? {
            let artifact = self.store.entry(
                kind,
                Stage::Uploading,
                &naming::artifact_name_for(manifest_handle.name()),
            )?;
            if !artifact.path().exists() {
                continue;
            }
            match self.store.read_manifest(&manifest_handle) {
                Ok(manifest) => claimed.extend(manifest.sources),
                Err(e) => {
                    warn!(kind = %kind, manifest = %manifest_handle.name(), error = %e, "Unreadable manifest");
                }
            }
        }
        Ok(claimed)
    }

    /// Delete a delivered artifact, then its sources, then its manifest
    fn release(
        &self,
        kind: RecordKind,
        artifact: &RecordHandle,
        manifest_handle: &RecordHandle,
        manifest: &ArtifactManifest,
    ) {
        if let Err(e) = self.store.finalize(artifact) {
            warn!(kind = %kind, artifact = %artifact.name(), error = %e, "Finalize failed");
            return;
        }
        self.finalize_sources(kind, manifest);
        if let Err(e) = self.store.finalize(manifest_handle) {
            warn!(kind = %kind, manifest = %manifest_handle.name(), error = %e, "Finalize failed");
        }
    }

    fn finalize_sources(&self, kind: RecordKind, manifest: &ArtifactManifest) -> usize {
        let mut finalized = 0;
        for name in &manifest.sources {
            let Some(handle) = self.store.lookup(kind, name) else {
                continue;
            };
            match self.store.finalize(&handle) {
                Ok(()) => finalized += 1,
                Err(e) => warn!(kind = %kind, file = %name, error = %e, "Finalize failed"),
            }
        }
        finalized
    }
}

/// Gzip `sources` into `writer` in the given order, newline-terminating each
/// payload; unreadable sources are skipped
///
/// Returns the writer and the names that made it into the stream.
pub fn write_aggregate<W: Write>(
    writer: W,
    sources: &[(String, PathBuf)],
) -> io::Result<(W, Vec<String>)> {
    let mut encoder = GzEncoder::new(writer, Compression::default());
    let mut included = Vec::with_capacity(sources.len());

    for (name, path) in sources {
        let payload = match std::fs::read(path) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(file = %name, error = %e, "Skipping unreadable record");
                continue;
            }
        };
        encoder.write_all(&payload)?;
        if payload.last() != Some(&b'\n') {
            encoder.write_all(b"\n")?;
        }
        included.push(name.clone());
    }

    Ok((encoder.finish()?, included))
}

fn compress_into_file(file: File, sources: Vec<(String, PathBuf)>) -> io::Result<Vec<String>> {
    let (writer, included) = write_aggregate(BufWriter::new(file), &sources)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(included)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::clock::{Clock, SimulatedClock};
    use crate::staging::config::BucketsConfig;
    use crate::staging::naming::MonotonicIdSource;
    use crate::staging::object_store::InMemoryObjectStore;
    use crate::staging::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig};
    use crate::staging::stage_store::StageStoreOptions;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn gunzip(data: &[u8]) -> String {
        let mut out = String::new();
        GzDecoder::new(data).read_to_string(&mut out).unwrap();
        out
    }

    struct Fixture {
        _dir: TempDir,
        clock: SimulatedClock,
        store: Arc<StageStore>,
        objects: SimulatedObjectStore<InMemoryObjectStore>,
        aggregator: Aggregator,
    }

    fn fixture() -> Fixture {
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
        let objects = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            7,
            SimulatedStoreConfig::no_faults(),
        );
        let uploader = Arc::new(
            Uploader::new(
                Arc::new(objects.clone()),
                BucketsConfig::test(),
                Arc::new(clock.clone()),
            )
            .with_hostname("test-host"),
        );
        let aggregator = Aggregator::new(store.clone(), uploader);
        Fixture {
            _dir: dir,
            clock,
            store,
            objects,
            aggregator,
        }
    }

    #[tokio::test]
    async fn test_tick_with_empty_incoming_is_idle() {
        let f = fixture();
        let outcome = f.aggregator.run_cycle(RecordKind::Usage, CycleTrigger::Tick).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);

        let outcome = f
            .aggregator
            .run_cycle(RecordKind::Usage, CycleTrigger::Reconcile)
            .await
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Empty);
        assert!(f.objects.inner().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_orders_and_terminates_lines() {
        let f = fixture();
        f.store.admit(RecordKind::Error, "alice", b"{\"n\":1}").unwrap();
        f.clock.advance_nanos(5);
        f.store.admit(RecordKind::Error, "bob", b"{\"n\":2}\n").unwrap();
        f.clock.advance_nanos(5);
        f.store.admit(RecordKind::Error, "carol", b"{\"n\":3}").unwrap();

        let outcome = f.aggregator.run_cycle(RecordKind::Error, CycleTrigger::Tick).await.unwrap();
        let CycleOutcome::Uploaded { key, records } = outcome else {
            panic!("expected upload, got {:?}", outcome);
        };
        assert_eq!(records, 3);
        assert!(key.ends_with(".test-host.jsonl.gz"));

        let object = f.objects.inner().get("error", &key).unwrap();
        assert_eq!(object.options.content_type.as_deref(), Some("application/gzip"));
        assert_eq!(gunzip(&object.data), "{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n");

        for stage in RecordKind::Error.stages() {
            assert_eq!(f.store.count(RecordKind::Error, *stage), 0);
        }
        assert!(f.store.list_manifests(RecordKind::Error, Stage::Uploading).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_is_retried_without_regeneration() {
        let f = fixture();
        f.store.admit(RecordKind::Usage, "alice", b"a").unwrap();
        f.objects.fail_next_puts(1);

        let err = f
            .aggregator
            .run_cycle(RecordKind::Usage, CycleTrigger::Tick)
            .await
            .unwrap_err();
        assert!(err.is_upload());
        let pending = f.store.list_artifacts(RecordKind::Usage, Stage::Uploading).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(f.store.count(RecordKind::Usage, Stage::Incoming), 0);
        assert_eq!(f.store.count(RecordKind::Usage, Stage::Aggregating), 1);

        // A new record arrives before the retry; it must not join the pending artifact
        f.clock.advance_nanos(10);
        f.store.admit(RecordKind::Usage, "bob", b"b").unwrap();

        let report = f.aggregator.process_remaining(RecordKind::Usage).await.unwrap();
        assert_eq!(report.retry.uploaded, 1);
        assert!(matches!(report.cycle, CycleOutcome::Uploaded { records: 1, .. }));

        let bodies: Vec<String> = f
            .objects
            .inner()
            .history()
            .iter()
            .map(|p| gunzip(&p.object.data))
            .collect();
        assert_eq!(bodies, vec!["a\n".to_string(), "b\n".to_string()]);
        assert!(f.store.list_artifacts(RecordKind::Usage, Stage::Uploading).unwrap().is_empty());
        assert_eq!(f.store.count(RecordKind::Usage, Stage::Aggregating), 0);
    }

    #[tokio::test]
    async fn test_orphan_manifest_releases_sources() {
        let f = fixture();
        let record = f.store.admit(RecordKind::Usage, "alice", b"a").unwrap();
        let record = f.store.promote_single(&record, Stage::Aggregating).unwrap();
        let manifest = ArtifactManifest::new(
            RecordKind::Usage,
            naming::artifact_name(1, 1),
            vec![record.name().to_string()],
            f.clock.now(),
        );
        f.store.write_manifest(&manifest).unwrap();

        let report = f.aggregator.retry_uploading(RecordKind::Usage).await.unwrap();
        assert_eq!(report.orphan_sources_finalized, 1);
        assert_eq!(f.store.count(RecordKind::Usage, Stage::Aggregating), 0);
        assert!(f.objects.inner().is_empty());
    }

    #[tokio::test]
    async fn test_torn_manifest_is_reported_until_removed() {
        let f = fixture();
        f.store.admit(RecordKind::Usage, "alice", b"u1").unwrap();
        f.objects.fail_next_puts(1);
        assert!(f.aggregator.run_cycle(RecordKind::Usage, CycleTrigger::Tick).await.is_err());

        let manifest = f.store.list_manifests(RecordKind::Usage, Stage::Uploading).unwrap();
        assert_eq!(manifest.len(), 1);
        std::fs::write(manifest[0].path(), b"{\"kind\":").unwrap();

        // Artifact goes out; its unclaimed source is aggregated again
        let first = f.aggregator.process_remaining(RecordKind::Usage).await.unwrap();
        assert_eq!(first.retry.uploaded, 1);
        assert_eq!(first.retry.unreadable_manifests, 1);
        assert!(matches!(first.cycle, CycleOutcome::Uploaded { records: 1, .. }));

        let second = f.aggregator.process_remaining(RecordKind::Usage).await.unwrap();
        assert_eq!(second.retry.unreadable_manifests, 1);
        assert!(manifest[0].path().exists());

        let bodies: Vec<String> = f
            .objects
            .inner()
            .history()
            .iter()
            .map(|p| gunzip(&p.object.data))
            .collect();
        assert_eq!(bodies, vec!["u1\n".to_string(), "u1\n".to_string()]);

        f.store.finalize(&manifest[0]).unwrap();
        let third = f.aggregator.process_remaining(RecordKind::Usage).await.unwrap();
        assert_eq!(third.retry, RetryReport::default());
    }

    #[tokio::test]
    async fn test_specimen_kind_is_rejected() {
        let f = fixture();
        let err = f
            .aggregator
            .run_cycle(RecordKind::Specimen, CycleTrigger::Tick)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStage { .. }));
    }

    #[test]
    fn test_write_aggregate_skips_missing_sources() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("1.1.a");
        std::fs::write(&present, b"x").unwrap();
        let sources = vec![
            ("1.1.a".to_string(), present),
            ("2.1.b".to_string(), dir.path().join("missing")),
        ];

        let (bytes, included) = write_aggregate(Vec::new(), &sources).unwrap();
        assert_eq!(included, vec!["1.1.a".to_string()]);
        assert_eq!(gunzip(&bytes), "x\n");
    }
}
