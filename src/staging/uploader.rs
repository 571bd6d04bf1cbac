//! Uploader
//!
//! Turns a staged artifact into an object-store `(bucket, key, body,
//! options)` and issues the put. Key layouts:
//!
//! ```text
//! usage/error: <prefix>YYYY/MM/DD/HH/YYYYMMDDHH.<hostname>.jsonl.gz
//! specimen:    <prefix><owner>/YYYY/MM/DD/<clean-stem>.<unix-nanos><ext>
//! ```
//!
//! Aggregate keys use the wall-clock hour of the upload, so two cycles in the
//! same UTC hour on the same host write the same key.

use super::clock::Clock;
use super::config::BucketsConfig;
use super::error::{PipelineError, PipelineResult};
use super::kind::RecordKind;
use super::naming::SpecimenName;
use super::object_store::{ObjectReader, ObjectStore, PutOptions};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::sync::Arc;
use tracing::info;

pub const AGGREGATE_CONTENT_TYPE: &str = "application/gzip";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Local hostname with dots replaced, or `unknown`
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .map(|h| h.replace('.', "-"))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn aggregate_key(prefix: &str, now: DateTime<Utc>, hostname: &str) -> String {
    format!(
        "{}{}/{}.{}.jsonl.gz",
        prefix,
        now.format("%Y/%m/%d/%H"),
        now.format("%Y%m%d%H"),
        hostname
    )
}

pub fn specimen_key(prefix: &str, owner: &str, specimen: &SpecimenName) -> String {
    let ts = specimen.timestamp;
    format!(
        "{}{}/{}/{}.{}{}",
        prefix,
        owner,
        ts.format("%Y/%m/%d"),
        clean_uri_stem(&specimen.uri),
        ts.timestamp_nanos_opt().unwrap_or_default(),
        extract_extension(&specimen.uri)
    )
}

fn last_segment(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

/// Suffix from the last `.` of a segment (empty if none)
fn raw_extension(segment: &str) -> &str {
    segment.rfind('.').map(|i| &segment[i..]).unwrap_or("")
}

/// Extension of the last path segment of a URI
///
/// Extensionless URIs mentioning "screenshot" are taken to be PNGs.
pub fn extract_extension(uri: &str) -> String {
    let ext = raw_extension(last_segment(uri));
    if ext.is_empty() && uri.to_lowercase().contains("screenshot") {
        return ".png".to_string();
    }
    ext.to_string()
}

/// Last path segment without its extension, with ` :?&=%#` replaced by `_`
pub fn clean_uri_stem(uri: &str) -> String {
    let segment = last_segment(uri);
    let stem = &segment[..segment.len() - raw_extension(segment).len()];
    stem.chars()
        .map(|c| match c {
            ' ' | ':' | '?' | '&' | '=' | '%' | '#' => '_',
            other => other,
        })
        .collect()
}

pub fn content_type_for(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".json" => "application/json",
        ".log" | ".txt" => "text/plain",
        ".html" => "text/html",
        ".xml" => "application/xml",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    buckets: BucketsConfig,
    hostname: String,
    clock: Arc<dyn Clock>,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, buckets: BucketsConfig, clock: Arc<dyn Clock>) -> Self {
        Uploader {
            store,
            buckets,
            hostname: local_hostname(),
            clock,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn buckets(&self) -> &BucketsConfig {
        &self.buckets
    }

    /// Turn a reader from [`StageStore::open_reader`](super::stage_store::StageStore::open_reader)
    /// into a streaming put body
    fn stream_body(file: File) -> PipelineResult<(ObjectReader, u64)> {
        let size = file.metadata()?.len();
        Ok((Box::pin(tokio::fs::File::from_std(file)), size))
    }

    /// Upload a compressed aggregate for `kind`; returns the object key
    pub async fn upload_aggregate(&self, kind: RecordKind, artifact: File) -> PipelineResult<String> {
        debug_assert!(kind.is_batched());
        let (bucket, prefix) = self.buckets.target(kind);
        let key = aggregate_key(prefix, self.clock.now(), &self.hostname);
        let (body, size) = Self::stream_body(artifact)?;
        let options = PutOptions::with_content_type(AGGREGATE_CONTENT_TYPE);

        self.store
            .put_stream(bucket, &key, body, size, &options)
            .await
            .map_err(|source| PipelineError::Upload {
                key: key.clone(),
                source,
            })?;

        info!(kind = %kind, bucket, key = %key, size, "Uploaded aggregated file");
        Ok(key)
    }

    /// Upload one specimen body with its original URI as metadata
    pub async fn upload_specimen(
        &self,
        owner: &str,
        specimen: &SpecimenName,
        body: File,
    ) -> PipelineResult<String> {
        let (bucket, prefix) = self.buckets.target(RecordKind::Specimen);
        let key = specimen_key(prefix, owner, specimen);
        let ext = extract_extension(&specimen.uri);
        let options =
            PutOptions::with_content_type(content_type_for(&ext)).metadata("uri", specimen.uri.as_str());
        let (body, size) = Self::stream_body(body)?;

        self.store
            .put_stream(bucket, &key, body, size, &options)
            .await
            .map_err(|source| PipelineError::Upload {
                key: key.clone(),
                source,
            })?;

        info!(bucket, key = %key, owner, uri = %specimen.uri, size, "Uploaded specimen");
        Ok(key)
    }

    /// HeadBucket every configured bucket
    pub async fn check_buckets(&self) -> PipelineResult<()> {
        for bucket in self.buckets.all_buckets() {
            self.store.head_bucket(bucket).await.map_err(|e| {
                PipelineError::Config(format!("bucket {} not accessible: {}", bucket, e))
            })?;
        }
        Ok(())
    }
}
