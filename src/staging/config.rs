//! Gateway Configuration
//!
//! Loaded from a TOML file, then overridden by `GATEWAY_*` environment
//! variables, then validated. Every section has defaults, so a file only
//! needs the bucket names.
//!
//! ```toml
//! cache_dir = "/var/lib/insights-gateway"
//!
//! [buckets]
//! usage_bucket = "insights-usage"
//! error_bucket = "insights-error"
//! specimen_bucket = "insights-specimen"
//!
//! [aggregation]
//! usage_interval_secs = 600
//! error_interval_secs = 600
//! ```

use super::error::{PipelineError, PipelineResult};
use super::kind::RecordKind;
use super::naming::{self, MonotonicIdSource, ProcessIdSource, UniqueIdSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main configuration for the gateway pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Root of the staging directories
    pub cache_dir: PathBuf,
    pub staging: StagingConfig,
    pub buckets: BucketsConfig,
    pub aggregation: AggregationConfig,
    pub fast_path: FastPathConfig,
    pub store: StoreConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            cache_dir: PathBuf::from("/var/lib/insights-gateway"),
            staging: StagingConfig::default(),
            buckets: BucketsConfig::default(),
            aggregation: AggregationConfig::default(),
            fast_path: FastPathConfig::default(),
            store: StoreConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Create config for testing (in-memory store, fast intervals)
    pub fn test(cache_dir: impl Into<PathBuf>) -> Self {
        GatewayConfig {
            cache_dir: cache_dir.into(),
            staging: StagingConfig::default(),
            buckets: BucketsConfig::test(),
            aggregation: AggregationConfig::test(),
            fast_path: FastPathConfig::test(),
            store: StoreConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> PipelineResult<Self> {
        toml::from_str(text).map_err(|e| PipelineError::Config(format!("invalid TOML: {}", e)))
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// File (or defaults), then environment overrides, then validation
    pub fn resolve(path: Option<&Path>) -> PipelineResult<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEWAY_*` overrides read through `lookup`
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> PipelineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |name: &str, slot: &mut String| {
            if let Some(v) = lookup(name) {
                *slot = v;
            }
        };
        string("GATEWAY_USAGE_BUCKET", &mut self.buckets.usage_bucket);
        string("GATEWAY_USAGE_PREFIX", &mut self.buckets.usage_prefix);
        string("GATEWAY_ERROR_BUCKET", &mut self.buckets.error_bucket);
        string("GATEWAY_ERROR_PREFIX", &mut self.buckets.error_prefix);
        string("GATEWAY_SPECIMEN_BUCKET", &mut self.buckets.specimen_bucket);
        string("GATEWAY_SPECIMEN_PREFIX", &mut self.buckets.specimen_prefix);
        string("GATEWAY_FALLBACK_OWNER", &mut self.fast_path.fallback_owner);
        string("GATEWAY_S3_REGION", &mut self.store.s3.region);

        if let Some(v) = lookup("GATEWAY_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GATEWAY_LOCAL_PATH") {
            self.store.local_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GATEWAY_S3_ENDPOINT") {
            self.store.s3.endpoint = Some(v);
        }
        if let Some(v) = lookup("GATEWAY_STORE_TYPE") {
            self.store.store_type = v.parse()?;
        }
        if let Some(v) = lookup("GATEWAY_FSYNC") {
            self.staging.fsync = parse_env("GATEWAY_FSYNC", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_ID_SOURCE") {
            self.staging.id_source = v.parse()?;
        }
        if let Some(v) = lookup("GATEWAY_USAGE_INTERVAL_SECS") {
            self.aggregation.usage_interval =
                Duration::from_secs(parse_env("GATEWAY_USAGE_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("GATEWAY_ERROR_INTERVAL_SECS") {
            self.aggregation.error_interval =
                Duration::from_secs(parse_env("GATEWAY_ERROR_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("GATEWAY_FAST_PATH_WORKERS") {
            self.fast_path.workers = parse_env("GATEWAY_FAST_PATH_WORKERS", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_FAST_PATH_QUEUE") {
            self.fast_path.queue_capacity = parse_env("GATEWAY_FAST_PATH_QUEUE", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_DRAIN_TIMEOUT_SECS") {
            self.shutdown.drain_timeout =
                Duration::from_secs(parse_env("GATEWAY_DRAIN_TIMEOUT_SECS", &v)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> PipelineResult<()> {
        for kind in RecordKind::ALL {
            let (bucket, _) = self.buckets.target(kind);
            if bucket.is_empty() {
                return Err(PipelineError::Config(format!("{}_bucket is required", kind)));
            }
        }
        for kind in RecordKind::BATCHED {
            if self.aggregation.interval(kind).is_zero() {
                return Err(PipelineError::Config(format!(
                    "{} aggregation interval must be positive",
                    kind
                )));
            }
        }
        if self.fast_path.workers == 0 || self.fast_path.queue_capacity == 0 {
            return Err(PipelineError::Config(
                "fast_path workers and queue_capacity must be positive".to_string(),
            ));
        }
        naming::validate_owner(&self.fast_path.fallback_owner)
            .map_err(|e| PipelineError::Config(format!("fallback_owner: {}", e)))?;
        if self.store.store_type == ObjectStoreType::LocalFs && self.store.local_path.is_none() {
            return Err(PipelineError::Config(
                "store.local_path is required for the localfs store".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> PipelineResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PipelineError::Config(format!("{}: cannot parse {:?}", name, value)))
}

/// Stage store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StagingConfig {
    /// fsync every admitted payload before it becomes visible
    pub fsync: bool,
    pub id_source: IdSourceKind,
}

/// How the id field of generated names is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdSourceKind {
    /// Random base plus counter
    #[default]
    Monotonic,
    /// OS process id
    ProcessId,
}

impl IdSourceKind {
    pub fn build(self) -> Arc<dyn UniqueIdSource> {
        match self {
            IdSourceKind::Monotonic => Arc::new(MonotonicIdSource::new()),
            IdSourceKind::ProcessId => Arc::new(ProcessIdSource),
        }
    }
}

impl std::str::FromStr for IdSourceKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monotonic" => Ok(IdSourceKind::Monotonic),
            "process_id" | "pid" => Ok(IdSourceKind::ProcessId),
            other => Err(PipelineError::Config(format!("unknown id source: {}", other))),
        }
    }
}

/// Destination bucket and key prefix per kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BucketsConfig {
    pub usage_bucket: String,
    pub usage_prefix: String,
    pub error_bucket: String,
    pub error_prefix: String,
    pub specimen_bucket: String,
    pub specimen_prefix: String,
}

impl BucketsConfig {
    pub fn test() -> Self {
        BucketsConfig {
            usage_bucket: "usage".to_string(),
            usage_prefix: String::new(),
            error_bucket: "error".to_string(),
            error_prefix: String::new(),
            specimen_bucket: "specimen".to_string(),
            specimen_prefix: String::new(),
        }
    }

    /// `(bucket, prefix)` for a kind
    pub fn target(&self, kind: RecordKind) -> (&str, &str) {
        match kind {
            RecordKind::Usage => (self.usage_bucket.as_str(), self.usage_prefix.as_str()),
            RecordKind::Error => (self.error_bucket.as_str(), self.error_prefix.as_str()),
            RecordKind::Specimen => (self.specimen_bucket.as_str(), self.specimen_prefix.as_str()),
        }
    }

    /// Distinct bucket names, in kind order
    pub fn all_buckets(&self) -> Vec<&str> {
        let mut buckets: Vec<&str> = Vec::with_capacity(3);
        for kind in RecordKind::ALL {
            let (bucket, _) = self.target(kind);
            if !buckets.contains(&bucket) {
                buckets.push(bucket);
            }
        }
        buckets
    }
}

/// Periodic aggregation intervals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    #[serde(rename = "usage_interval_secs", with = "duration_secs")]
    pub usage_interval: Duration,
    #[serde(rename = "error_interval_secs", with = "duration_secs")]
    pub error_interval: Duration,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            usage_interval: Duration::from_secs(600),
            error_interval: Duration::from_secs(600),
        }
    }
}

impl AggregationConfig {
    pub fn test() -> Self {
        AggregationConfig {
            usage_interval: Duration::from_secs(1),
            error_interval: Duration::from_secs(1),
        }
    }

    pub fn interval(&self, kind: RecordKind) -> Duration {
        match kind {
            RecordKind::Usage => self.usage_interval,
            RecordKind::Error => self.error_interval,
            RecordKind::Specimen => Duration::ZERO,
        }
    }
}

/// Specimen delivery pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPathConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Owner used for specimens whose owner is no longer known (after a restart)
    pub fallback_owner: String,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        FastPathConfig {
            workers: 4,
            queue_capacity: 1024,
            fallback_owner: "unknown".to_string(),
        }
    }
}

impl FastPathConfig {
    pub fn test() -> Self {
        FastPathConfig {
            workers: 2,
            queue_capacity: 16,
            fallback_owner: "unknown".to_string(),
        }
    }
}

/// Type of object store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreType {
    /// In-memory store (for tests)
    #[default]
    Memory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible (requires the `s3` feature)
    S3,
}

impl std::str::FromStr for ObjectStoreType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(ObjectStoreType::Memory),
            "localfs" => Ok(ObjectStoreType::LocalFs),
            "s3" => Ok(ObjectStoreType::S3),
            other => Err(PipelineError::Config(format!("unknown store type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub store_type: ObjectStoreType,
    /// Root directory for the localfs store (one subdirectory per bucket)
    pub local_path: Option<PathBuf>,
    pub s3: S3Config,
}

/// S3 configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        S3Config {
            region: "ap-northeast-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound the entry point puts on the whole drain
    #[serde(rename = "drain_timeout_secs", with = "duration_secs")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig {
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Serde helper for Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
