//! Durable Staging and Delivery Pipeline
//!
//! Telemetry records are staged on local disk, then delivered to object
//! storage. Usage and error records are batched into gzipped JSON-lines
//! aggregates on a timer; specimens are uploaded one by one as soon as they
//! arrive.
//!
//! ## Architecture
//!
//! ```text
//! <base>/usage/{*, aggregation/*, uploading/*}
//! <base>/error/{*, aggregation/*, uploading/*}
//! <base>/specimen/{*, uploading/*}
//!
//! Incoming ──promote──► Aggregating ──gzip──► Uploading ──put──► finalize
//! ```
//!
//! ## Key Features
//!
//! - **Crash safety**: a record is only deleted after the object holding it
//!   was written; startup and shutdown run an idempotent reconciliation pass
//! - **Order**: records inside one aggregate follow their staged name order
//! - **Bounded fast path**: specimen uploads go through a fixed worker pool
//! - **Deterministic simulation**: seeded clock, id source and faulty store

pub mod kind;
pub mod error;
pub mod clock;
pub mod naming;
pub mod manifest;
pub mod stage_store;
pub mod object_store;
pub mod simulated_store;
pub mod config;
pub mod uploader;
pub mod aggregator;
pub mod fast_path;
pub mod worker;
pub mod reconcile;
pub mod drain;
pub mod gateway;
pub mod dst;
#[cfg(feature = "s3")]
pub mod s3_store;

pub use kind::{RecordKind, Stage};
pub use error::{PipelineError, PipelineResult};
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use naming::{
    BatchedName, MonotonicIdSource, ProcessIdSource, SpecimenName, UniqueIdSource,
    decode_batched_name, decode_specimen_name, query_escape, query_unescape,
};
pub use manifest::ArtifactManifest;
pub use stage_store::{PromoteReport, RecordHandle, RecordId, StageStore, StageStoreOptions};
pub use object_store::{
    InMemoryObjectStore, ListResult, LocalFsObjectStore, ObjectMeta, ObjectReader, ObjectStore,
    PutOptions, PutRecord, StoredObject,
};
pub use simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
pub use config::{
    AggregationConfig, BucketsConfig, FastPathConfig, GatewayConfig, IdSourceKind, ObjectStoreType,
    S3Config, ShutdownConfig, StagingConfig, StoreConfig,
};
pub use uploader::Uploader;
pub use aggregator::{Aggregator, CycleOutcome, CycleTrigger, RemainingReport, RetryReport};
pub use fast_path::{
    EnqueueOutcome, FastPathHandle, SpecimenJob, SpecimenRecovery, deliver_specimen,
    recover_specimens, spawn_fast_path,
};
pub use worker::spawn_aggregation_worker;
pub use reconcile::{ReconcileReport, Reconciler};
pub use drain::{DrainController, DrainOutcome, DrainState};
pub use gateway::{Gateway, Producer};
pub use dst::{
    StagingDSTConfig, StagingDSTHarness, StagingDSTResult, run_staging_dst_batch,
    summarize_staging_dst_batch,
};
#[cfg(feature = "s3")]
pub use s3_store::S3ObjectStore;
