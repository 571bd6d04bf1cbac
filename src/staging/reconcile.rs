//! Reconciliation pass
//!
//! Idempotent recovery run at startup and at shutdown. Each batched kind
//! gets its Uploading leftovers retried and one reconcile cycle over
//! Aggregating and Incoming; then every leftover specimen is delivered.
//! A failure in one kind never stops the others.

use super::aggregator::{Aggregator, CycleOutcome};
use super::error::PipelineError;
use super::fast_path::recover_specimens;
use super::kind::RecordKind;
use super::stage_store::StageStore;
use super::uploader::Uploader;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Aggregate artifacts uploaded (retries plus fresh cycles)
    pub uploaded_artifacts: usize,
    /// Records written into freshly built artifacts
    pub aggregated_records: usize,
    pub delivered_specimens: usize,
    /// Artifacts whose retried upload failed again (kept in Uploading)
    pub pending_artifacts: usize,
    /// Specimens whose delivery failed (kept for the next pass)
    pub pending_specimens: usize,
    /// Torn manifests left in Uploading for an operator
    pub unreadable_manifests: usize,
    /// Kinds whose pass aborted
    pub failures: Vec<(RecordKind, PipelineError)>,
}

impl ReconcileReport {
    /// Everything staged before the pass has been delivered
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
            && self.pending_artifacts == 0
            && self.pending_specimens == 0
            && self.unreadable_manifests == 0
    }
}

pub struct Reconciler {
    store: Arc<StageStore>,
    uploader: Arc<Uploader>,
    aggregator: Arc<Aggregator>,
    fallback_owner: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<StageStore>,
        uploader: Arc<Uploader>,
        aggregator: Arc<Aggregator>,
        fallback_owner: impl Into<String>,
    ) -> Self {
        Reconciler {
            store,
            uploader,
            aggregator,
            fallback_owner: fallback_owner.into(),
        }
    }

    pub async fn process_remaining(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for kind in RecordKind::BATCHED {
            match self.aggregator.process_remaining(kind).await {
                Ok(remaining) => {
                    report.uploaded_artifacts += remaining.retry.uploaded;
                    report.pending_artifacts += remaining.retry.failed;
                    report.unreadable_manifests += remaining.retry.unreadable_manifests;
                    if let CycleOutcome::Uploaded { records, .. } = remaining.cycle {
                        report.uploaded_artifacts += 1;
                        report.aggregated_records += records;
                    }
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Reconciliation failed for kind");
                    report.failures.push((kind, e));
                }
            }
        }

        match recover_specimens(&self.store, &self.uploader, &self.fallback_owner).await {
            Ok(recovery) => {
                report.delivered_specimens = recovery.delivered;
                report.pending_specimens = recovery.failed;
            }
            Err(e) => {
                warn!(kind = %RecordKind::Specimen, error = %e, "Specimen recovery failed");
                report.failures.push((RecordKind::Specimen, e));
            }
        }

        info!(
            uploaded_artifacts = report.uploaded_artifacts,
            aggregated_records = report.aggregated_records,
            delivered_specimens = report.delivered_specimens,
            pending_artifacts = report.pending_artifacts,
            pending_specimens = report.pending_specimens,
            unreadable_manifests = report.unreadable_manifests,
            failures = report.failures.len(),
            "Reconciliation pass finished"
        );
        report
    }
}
