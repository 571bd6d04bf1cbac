//! Staging Pipeline Deterministic Simulation Testing Harness
//!
//! Verifies delivery guarantees under object-store faults and crashes:
//!
//! - **No loss**: every admitted record reaches the object store at least once
//! - **Order**: within one aggregate, records appear in admission order
//! - **Drained**: after a fault-free reconciliation nothing is left staged
//!
//! ## DST Methodology
//!
//! 1. Drive admissions, periodic cycles and fast-path deliveries from a seeded RNG
//! 2. Inject put failures through `SimulatedObjectStore`
//! 3. Crash at random points: drop the store, leave torn files and
//!    half-promoted batches on disk, reopen, run the startup reconciliation
//! 4. Disable faults, reconcile, and check every admitted record against the
//!    object store's put history

use super::aggregator::{Aggregator, CycleTrigger};
use super::clock::{Clock, SimulatedClock};
use super::config::BucketsConfig;
use super::fast_path::deliver_specimen;
use super::kind::{RecordKind, Stage};
use super::naming::{self, MonotonicIdSource};
use super::object_store::InMemoryObjectStore;
use super::reconcile::Reconciler;
use super::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
use super::stage_store::{StageStore, StageStoreOptions};
use super::uploader::Uploader;
use flate2::read::GzDecoder;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// 2023-11-14T22:13:20Z
const START_NANOS: i64 = 1_700_000_000_000_000_000;
const DST_OWNER: &str = "dst-owner";

/// Payload written for every simulated record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct DstPayload {
    kind: RecordKind,
    seq: u64,
}

/// Result of a single DST run
#[derive(Debug)]
pub struct StagingDSTResult {
    pub seed: u64,
    pub admitted: usize,
    pub crashes: usize,
    pub cycles: usize,
    pub failed_cycles: usize,
    pub failed_deliveries: usize,
    pub delivered_records: usize,
    /// Records seen more than once (allowed: delivery is at-least-once)
    pub duplicate_records: usize,
    pub missing_records: usize,
    pub order_violations: usize,
    pub leftover_entries: usize,
    pub store_stats: SimulatedStoreStats,
    pub passed: bool,
    pub error_message: Option<String>,
}

impl StagingDSTResult {
    fn new(seed: u64) -> Self {
        StagingDSTResult {
            seed,
            admitted: 0,
            crashes: 0,
            cycles: 0,
            failed_cycles: 0,
            failed_deliveries: 0,
            delivered_records: 0,
            duplicate_records: 0,
            missing_records: 0,
            order_violations: 0,
            leftover_entries: 0,
            store_stats: SimulatedStoreStats::default(),
            passed: false,
            error_message: None,
        }
    }

    fn fail(mut self, message: String) -> Self {
        self.passed = false;
        self.error_message = Some(message);
        self
    }
}

/// Configuration for the staging DST harness
#[derive(Debug, Clone)]
pub struct StagingDSTConfig {
    /// Admissions per run
    pub num_operations: usize,
    /// Share of admissions that are specimens
    pub specimen_prob: f64,
    /// Probability of an aggregation cycle after each admission
    pub cycle_prob: f64,
    /// Probability that an admitted specimen is delivered right away
    pub fast_path_prob: f64,
    /// Probability of a crash after each admission
    pub crash_prob: f64,
    /// Probability that the clock jumps an hour (aggregate key rollover)
    pub hour_jump_prob: f64,
    pub store_config: SimulatedStoreConfig,
}

impl Default for StagingDSTConfig {
    fn default() -> Self {
        StagingDSTConfig {
            num_operations: 120,
            specimen_prob: 0.15,
            cycle_prob: 0.2,
            fast_path_prob: 0.7,
            crash_prob: 0.02,
            hour_jump_prob: 0.01,
            store_config: SimulatedStoreConfig::default(),
        }
    }
}

impl StagingDSTConfig {
    /// No faults, no crashes
    pub fn calm() -> Self {
        StagingDSTConfig {
            crash_prob: 0.0,
            store_config: SimulatedStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Occasional put failures and crashes
    pub fn moderate() -> Self {
        StagingDSTConfig::default()
    }

    /// Frequent put failures, timeouts and crashes
    pub fn chaos() -> Self {
        StagingDSTConfig {
            crash_prob: 0.06,
            cycle_prob: 0.3,
            store_config: SimulatedStoreConfig::high_chaos(),
            ..Default::default()
        }
    }
}

struct Pipeline {
    store: Arc<StageStore>,
    uploader: Arc<Uploader>,
    aggregator: Arc<Aggregator>,
    reconciler: Reconciler,
}

/// Staging DST Harness
pub struct StagingDSTHarness {
    seed: u64,
    rng: ChaCha8Rng,
    config: StagingDSTConfig,
}

impl StagingDSTHarness {
    pub fn new(seed: u64, config: StagingDSTConfig) -> Self {
        StagingDSTHarness {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    fn open(
        &mut self,
        base: &Path,
        clock: &SimulatedClock,
        objects: &SimulatedObjectStore<InMemoryObjectStore>,
    ) -> Result<Pipeline, String> {
        let store = StageStore::open(
            base,
            StageStoreOptions {
                clock: Arc::new(clock.clone()),
                ids: Arc::new(MonotonicIdSource::starting_at(self.rng.gen_range(1..1_000_000))),
                fsync: false,
            },
        )
        .map_err(|e| format!("open stage store: {}", e))?;
        let store = Arc::new(store);
        let uploader = Arc::new(
            Uploader::new(Arc::new(objects.clone()), BucketsConfig::test(), Arc::new(clock.clone()))
                .with_hostname("dst-host"),
        );
        let aggregator = Arc::new(Aggregator::new(store.clone(), uploader.clone()));
        let reconciler = Reconciler::new(store.clone(), uploader.clone(), aggregator.clone(), DST_OWNER);
        Ok(Pipeline {
            store,
            uploader,
            aggregator,
            reconciler,
        })
    }

    fn pick_batched(&mut self) -> RecordKind {
        RecordKind::BATCHED[self.rng.gen_range(0..RecordKind::BATCHED.len())]
    }

    /// Run a single DST scenario rooted at `base`
    pub async fn run(&mut self, base: &Path) -> StagingDSTResult {
        let mut result = StagingDSTResult::new(self.seed);
        let clock = SimulatedClock::from_nanos(START_NANOS);
        let objects = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            self.rng.gen(),
            self.config.store_config.clone(),
        );
        let mut pipeline = match self.open(base, &clock, &objects) {
            Ok(p) => p,
            Err(e) => return result.fail(e),
        };

        // Phase 1: workload with faults and crashes
        let mut admitted: Vec<DstPayload> = Vec::with_capacity(self.config.num_operations);
        for seq in 0..self.config.num_operations as u64 {
            // Strictly increasing time keeps name order equal to admission order
            clock.advance_nanos(self.rng.gen_range(1..5_000_000));
            if self.rng.gen_bool(self.config.hour_jump_prob) {
                clock.advance(Duration::from_secs(3600));
            }

            let kind = if self.rng.gen_bool(self.config.specimen_prob) {
                RecordKind::Specimen
            } else {
                self.pick_batched()
            };
            let payload = DstPayload { kind, seq };
            let body = match serde_json::to_vec(&payload) {
                Ok(body) => body,
                Err(e) => return result.fail(format!("encode payload: {}", e)),
            };

            if kind == RecordKind::Specimen {
                let uri = format!("http://dst.example/img/{} shot.png?v={}", seq, seq);
                let handle = match pipeline.store.admit_specimen(DST_OWNER, &uri, &body) {
                    Ok(handle) => handle,
                    Err(e) => return result.fail(format!("admit specimen {}: {}", seq, e)),
                };
                if self.rng.gen_bool(self.config.fast_path_prob)
                    && deliver_specimen(&pipeline.store, &pipeline.uploader, &handle, DST_OWNER)
                        .await
                        .is_err()
                {
                    result.failed_deliveries += 1;
                }
            } else if let Err(e) = pipeline.store.admit(kind, DST_OWNER, &body) {
                return result.fail(format!("admit {} {}: {}", kind, seq, e));
            }
            admitted.push(payload);

            if self.rng.gen_bool(self.config.cycle_prob) {
                let kind = self.pick_batched();
                match pipeline.aggregator.run_cycle(kind, CycleTrigger::Tick).await {
                    Ok(_) => result.cycles += 1,
                    Err(_) => result.failed_cycles += 1,
                }
            }

            if self.rng.gen_bool(self.config.crash_prob) {
                if let Err(e) = self.leave_crash_debris(&pipeline.store, &clock) {
                    return result.fail(format!("crash debris: {}", e));
                }
                drop(pipeline);
                result.crashes += 1;

                pipeline = match self.open(base, &clock, &objects) {
                    Ok(p) => p,
                    Err(e) => return result.fail(format!("reopen after crash: {}", e)),
                };
                // Startup reconciliation, still under faults
                pipeline.reconciler.process_remaining().await;
            }
        }
        result.admitted = admitted.len();

        // Phase 2: fault-free reconciliation
        objects.set_faults_enabled(false);
        let mut clean = false;
        for _ in 0..3 {
            if pipeline.reconciler.process_remaining().await.is_clean() {
                clean = true;
                break;
            }
        }
        result.store_stats = objects.stats();
        if !clean {
            return result.fail("fault-free reconciliation did not converge".to_string());
        }

        // Phase 3: verify
        result.leftover_entries = count_leftovers(&pipeline.store);
        let seen = match verify_deliveries(objects.inner(), &mut result) {
            Ok(seen) => seen,
            Err(e) => return result.fail(e),
        };

        let mut missing = Vec::new();
        for payload in &admitted {
            match seen.get(payload).copied().unwrap_or(0) {
                0 => {
                    result.missing_records += 1;
                    if missing.len() < 10 {
                        missing.push(*payload);
                    }
                }
                1 => {}
                _ => result.duplicate_records += 1,
            }
        }

        result.passed =
            result.missing_records == 0 && result.order_violations == 0 && result.leftover_entries == 0;
        if !result.passed {
            result.error_message = Some(format!(
                "INVARIANT VIOLATION: {} missing (first 10: {:?}), {} order violations, {} entries left staged",
                result.missing_records, missing, result.order_violations, result.leftover_entries
            ));
        }
        result
    }

    /// What a crash can leave on disk: a half-promoted batch, a torn
    /// admission temp file and a torn aggregate
    fn leave_crash_debris(&mut self, store: &StageStore, clock: &SimulatedClock) -> std::io::Result<()> {
        let kind = self.pick_batched();
        if let Ok(incoming) = store.list(kind, Stage::Incoming) {
            let take = self.rng.gen_range(0..=incoming.len());
            let _ = store.promote(kind, &incoming[..take], Stage::Aggregating);
        }

        if self.rng.gen_bool(0.5) {
            if let Ok(dir) = store.stage_dir(kind, Stage::Incoming) {
                let name = naming::batched_name(clock.now_nanos(), 0, "torn");
                std::fs::write(dir.join(format!(".admit-{}", name)), b"{\"kind\":\"us")?;
            }
        }

        if self.rng.gen_bool(0.5) {
            if let Ok(dir) = store.stage_dir(kind, Stage::Aggregating) {
                let torn: Vec<u8> = (0..self.rng.gen_range(1..64)).map(|_| self.rng.gen()).collect();
                std::fs::write(dir.join(naming::artifact_name(clock.now_nanos(), u64::MAX)), torn)?;
            }
        }
        Ok(())
    }
}

fn count_leftovers(store: &StageStore) -> usize {
    let mut leftovers = 0;
    for kind in RecordKind::ALL {
        for stage in kind.stages() {
            leftovers += store.count(kind, *stage);
            leftovers += store.list_artifacts(kind, *stage).map(|a| a.len()).unwrap_or(0);
            leftovers += store.list_manifests(kind, *stage).map(|m| m.len()).unwrap_or(0);
        }
    }
    leftovers
}

/// Count every payload in the put history and check in-artifact order
fn verify_deliveries(
    objects: &InMemoryObjectStore,
    result: &mut StagingDSTResult,
) -> Result<HashMap<DstPayload, usize>, String> {
    let mut seen: HashMap<DstPayload, usize> = HashMap::new();

    for put in objects.history() {
        let kind: RecordKind = put
            .bucket
            .parse()
            .map_err(|e| format!("put to unexpected bucket: {}", e))?;

        let payloads: Vec<DstPayload> = if kind.is_batched() {
            let mut text = String::new();
            GzDecoder::new(&put.object.data[..])
                .read_to_string(&mut text)
                .map_err(|e| format!("corrupt aggregate {}: {}", put.key, e))?;
            text.lines()
                .map(|line| serde_json::from_str(line))
                .collect::<Result<_, _>>()
                .map_err(|e| format!("bad line in {}: {}", put.key, e))?
        } else {
            vec![serde_json::from_slice(&put.object.data)
                .map_err(|e| format!("bad specimen {}: {}", put.key, e))?]
        };

        for window in payloads.windows(2) {
            if window[0].seq >= window[1].seq {
                result.order_violations += 1;
            }
        }
        for payload in payloads {
            if payload.kind != kind {
                return Err(format!("{} record delivered to {} bucket", payload.kind, kind));
            }
            result.delivered_records += 1;
            *seen.entry(payload).or_insert(0) += 1;
        }
    }
    Ok(seen)
}

/// Run a batch of DST scenarios, one subdirectory of `base` per seed
pub async fn run_staging_dst_batch(
    seeds: std::ops::Range<u64>,
    config: StagingDSTConfig,
    base: &Path,
) -> Vec<StagingDSTResult> {
    let mut results = Vec::with_capacity(seeds.end.saturating_sub(seeds.start) as usize);
    for seed in seeds {
        let mut harness = StagingDSTHarness::new(seed, config.clone());
        results.push(harness.run(&base.join(format!("seed-{}", seed))).await);
    }
    results
}

/// Summarize batch results
pub fn summarize_staging_dst_batch(results: &[StagingDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let admitted: usize = results.iter().map(|r| r.admitted).sum();
    let delivered: usize = results.iter().map(|r| r.delivered_records).sum();
    let duplicates: usize = results.iter().map(|r| r.duplicate_records).sum();
    let missing: usize = results.iter().map(|r| r.missing_records).sum();
    let crashes: usize = results.iter().map(|r| r.crashes).sum();
    let failed_cycles: usize = results.iter().map(|r| r.failed_cycles).sum();

    let mut summary = format!(
        "Staging DST Batch: {}/{} passed ({} failed)\n\
         Admitted: {}, Delivered: {}, Duplicates: {}, Missing: {}, Crashes: {}, Failed cycles: {}",
        passed, total, failed, admitted, delivered, duplicates, missing, crashes, failed_cycles
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}
