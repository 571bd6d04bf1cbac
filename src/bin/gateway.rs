//! Insights Gateway
//!
//! Stages usage, error and specimen records on local disk and delivers them
//! to object storage. Runs a reconciliation pass at startup, aggregates on a
//! timer, and drains on Ctrl-C / SIGTERM.
//!
//! ```text
//! insights-gateway [CONFIG.toml] [--flush]
//! ```
//!
//! `--flush` runs one reconciliation pass over the cache directory and exits.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | GATEWAY_CONFIG | - | Config file (if no path argument) |
//! | GATEWAY_CACHE_DIR | /var/lib/insights-gateway | Staging root |
//! | GATEWAY_USAGE_BUCKET | - | Usage bucket (required) |
//! | GATEWAY_ERROR_BUCKET | - | Error bucket (required) |
//! | GATEWAY_SPECIMEN_BUCKET | - | Specimen bucket (required) |
//! | GATEWAY_STORE_TYPE | memory | memory, localfs, or s3 |
//! | GATEWAY_LOCAL_PATH | - | LocalFs root (one directory per bucket) |
//! | GATEWAY_S3_REGION | ap-northeast-1 | S3 region |
//! | GATEWAY_S3_ENDPOINT | - | MinIO/LocalStack endpoint URL |
//! | AWS_ACCESS_KEY_ID | - | S3 credentials |
//! | AWS_SECRET_ACCESS_KEY | - | S3 credentials |
//!
//! ## Logging
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | RUST_LOG | info | Filter directives |
//! | GATEWAY_LOG_FORMAT | pretty | pretty or json |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use insights_gateway::observability::{init_tracing, LogConfig};
use insights_gateway::staging::{
    Aggregator, DrainOutcome, Gateway, GatewayConfig, InMemoryObjectStore, LocalFsObjectStore,
    ObjectStore, ObjectStoreType, PipelineError, PipelineResult, Reconciler, StageStore,
    StageStoreOptions, SystemClock, Uploader,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

struct Args {
    config_path: Option<PathBuf>,
    flush: bool,
}

impl Args {
    fn parse() -> Self {
        let mut config_path = None;
        let mut flush = false;
        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--flush" => flush = true,
                other => config_path = Some(PathBuf::from(other)),
            }
        }
        Args {
            config_path: config_path.or_else(|| std::env::var("GATEWAY_CONFIG").ok().map(PathBuf::from)),
            flush,
        }
    }
}

fn build_store(config: &GatewayConfig) -> PipelineResult<Arc<dyn ObjectStore>> {
    match config.store.store_type {
        ObjectStoreType::Memory => {
            warn!("Using in-memory object store; uploads are discarded on exit");
            Ok(Arc::new(InMemoryObjectStore::new()))
        }
        ObjectStoreType::LocalFs => {
            let root = config.store.local_path.clone().ok_or_else(|| {
                PipelineError::Config("store.local_path is required for localfs".to_string())
            })?;
            let store = LocalFsObjectStore::new(root);
            for bucket in config.buckets.all_buckets() {
                store.create_bucket(bucket)?;
            }
            Ok(Arc::new(store))
        }
        #[cfg(feature = "s3")]
        ObjectStoreType::S3 => {
            let store = insights_gateway::staging::S3ObjectStore::new(
                &config.store.s3,
                config.buckets.all_buckets(),
            )?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        ObjectStoreType::S3 => Err(PipelineError::Config(
            "store type s3 requires building with --features s3".to_string(),
        )),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler; waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// One reconciliation pass without starting workers
async fn flush(config: &GatewayConfig, objects: Arc<dyn ObjectStore>) -> PipelineResult<bool> {
    let store = Arc::new(StageStore::open(
        &config.cache_dir,
        StageStoreOptions {
            clock: Arc::new(SystemClock),
            ids: config.staging.id_source.build(),
            fsync: config.staging.fsync,
        },
    )?);
    let uploader = Arc::new(Uploader::new(objects, config.buckets.clone(), Arc::new(SystemClock)));
    let aggregator = Arc::new(Aggregator::new(store.clone(), uploader.clone()));
    let reconciler = Reconciler::new(store, uploader, aggregator, config.fast_path.fallback_owner.clone());
    Ok(reconciler.process_remaining().await.is_clean())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing(&LogConfig::from_env())?;
    let args = Args::parse();

    let config = GatewayConfig::resolve(args.config_path.as_deref())?;
    let objects = build_store(&config)?;

    let bucket_check = Uploader::new(objects.clone(), config.buckets.clone(), Arc::new(SystemClock));
    if let Err(e) = bucket_check.check_buckets().await {
        error!(error = %e, "Bucket check failed");
        return Err(e.into());
    }

    if args.flush {
        let clean = flush(&config, objects).await?;
        info!(clean, "Flush finished");
        return Ok(());
    }

    let drain_timeout = config.shutdown.drain_timeout;
    let gateway = Gateway::start(config, objects).await?;
    info!("Insights gateway running; press Ctrl-C to drain and exit");
    shutdown_signal().await;
    info!("Shutdown signal received");

    match tokio::time::timeout(drain_timeout, gateway.drain()).await {
        Ok(DrainOutcome::Completed(report)) if report.is_clean() => {
            info!("Drain complete");
        }
        Ok(DrainOutcome::Completed(report)) => {
            warn!(
                pending_artifacts = report.pending_artifacts,
                pending_specimens = report.pending_specimens,
                unreadable_manifests = report.unreadable_manifests,
                failures = report.failures.len(),
                "Drain left records staged; they are retried on next start"
            );
        }
        Ok(DrainOutcome::AlreadyRequested) => {}
        Err(_) => {
            warn!(timeout_secs = drain_timeout.as_secs(), "Drain timed out; staged records are retried on next start");
        }
    }

    Ok(())
}
