//! Object Store Abstraction
//!
//! The pipeline needs only three things from remote storage: write an object
//! (buffered or streamed) with a content type and metadata, list a prefix,
//! and check that a bucket exists at startup.
//!
//! Implementations:
//! - `InMemoryObjectStore`: For unit tests and DST (keeps the full put history)
//! - `LocalFsObjectStore`: For development and local testing
//! - `S3ObjectStore`: For production (feature `s3`)
//! - `SimulatedObjectStore`: Fault-injecting wrapper for DST

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Streaming body for `put_stream`
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Content type and user metadata attached to a put
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl PutOptions {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        PutOptions {
            content_type: Some(content_type.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Metadata for a stored object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key (path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Creation timestamp (Unix ms)
    pub created_at_ms: u64,
}

/// Result of a list operation
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    /// Objects matching the prefix, sorted by key
    pub objects: Vec<ObjectMeta>,
}

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    /// Put an object (create or overwrite)
    fn put<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        data: &'a [u8],
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    /// Put an object whose body is read from `reader` (`size` bytes)
    fn put_stream<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        reader: ObjectReader,
        size: u64,
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    /// List objects with a prefix
    fn list<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>>;

    /// Fail unless the bucket exists and is reachable
    fn head_bucket<'a>(
        &'a self,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn put<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        data: &'a [u8],
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        (**self).put(bucket, key, data, options)
    }

    fn put_stream<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        reader: ObjectReader,
        size: u64,
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        (**self).put_stream(bucket, key, reader, size, options)
    }

    fn list<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>> {
        (**self).list(bucket, prefix)
    }

    fn head_bucket<'a>(
        &'a self,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        (**self).head_bucket(bucket)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn no_such_bucket(bucket: &str) -> IoError {
    IoError::new(ErrorKind::NotFound, format!("Bucket not found: {}", bucket))
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

/// A stored object as seen by tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub options: PutOptions,
    pub created_at_ms: u64,
}

/// One successful put, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecord {
    pub bucket: String,
    pub key: String,
    pub object: StoredObject,
}

#[derive(Debug, Default)]
struct InMemoryState {
    objects: HashMap<(String, String), StoredObject>,
    history: Vec<PutRecord>,
}

/// In-memory object store for unit tests and deterministic simulation
///
/// Keeps every successful put in `history()`, so same-key overwrites stay
/// observable. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    state: Arc<RwLock<InMemoryState>>,
    /// `None` accepts any bucket
    buckets: Option<Arc<HashSet<String>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the store to a fixed set of buckets
    pub fn with_buckets<I, B>(buckets: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<String>,
    {
        InMemoryObjectStore {
            state: Arc::default(),
            buckets: Some(Arc::new(buckets.into_iter().map(Into::into).collect())),
        }
    }

    fn check_bucket(&self, bucket: &str) -> IoResult<()> {
        match &self.buckets {
            Some(known) if !known.contains(bucket) => Err(no_such_bucket(bucket)),
            _ => Ok(()),
        }
    }

    fn store(&self, bucket: &str, key: &str, data: Vec<u8>, options: &PutOptions) {
        let object = StoredObject {
            data,
            options: options.clone(),
            created_at_ms: now_ms(),
        };
        let mut state = self.state.write();
        state.history.push(PutRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            object: object.clone(),
        });
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), object);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state
            .read()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Current objects of a bucket, sorted by key
    pub fn objects(&self, bucket: &str) -> Vec<(String, StoredObject)> {
        let state = self.state.read();
        let mut objects: Vec<_> = state
            .objects
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        objects
    }

    /// Every successful put in call order
    pub fn history(&self) -> Vec<PutRecord> {
        self.state.read().history.clone()
    }

    /// Get the number of stored objects (for testing)
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Check if empty (for testing)
    pub fn is_empty(&self) -> bool {
        self.state.read().objects.is_empty()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        data: &'a [u8],
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.check_bucket(bucket)?;
            self.store(bucket, key, data.to_vec(), options);
            Ok(())
        })
    }

    fn put_stream<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        mut reader: ObjectReader,
        size: u64,
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.check_bucket(bucket)?;
            let mut data = Vec::with_capacity(size as usize);
            reader.read_to_end(&mut data).await?;
            if data.len() as u64 != size {
                return Err(IoError::new(
                    ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, read {}", size, data.len()),
                ));
            }
            self.store(bucket, key, data, options);
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>> {
        Box::pin(async move {
            self.check_bucket(bucket)?;
            let objects = self
                .objects(bucket)
                .into_iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(key, obj)| ObjectMeta {
                    key,
                    size_bytes: obj.data.len() as u64,
                    created_at_ms: obj.created_at_ms,
                })
                .collect();
            Ok(ListResult { objects })
        })
    }

    fn head_bucket<'a>(
        &'a self,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move { self.check_bucket(bucket) })
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

const META_SUFFIX: &str = ".meta.json";

/// Local filesystem object store for development and testing
///
/// Layout: `<base>/<bucket>/<key>`, with put options stored in a
/// `<key>.meta.json` sidecar. A bucket exists when its directory does.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsObjectStore {
            base_path: base_path.into(),
        }
    }

    pub fn create_bucket(&self, bucket: &str) -> IoResult<()> {
        std::fs::create_dir_all(self.base_path.join(bucket))
    }

    /// Get the base path (for testing)
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn bucket_dir(&self, bucket: &str) -> IoResult<PathBuf> {
        let dir = self.base_path.join(bucket);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(no_such_bucket(bucket))
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> IoResult<PathBuf> {
        if key.is_empty() || key.split('/').any(|seg| seg == "..") {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("Invalid object key: {:?}", key),
            ));
        }
        let path = self.bucket_dir(bucket)?.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    async fn write_meta(path: &Path, options: &PutOptions) -> IoResult<()> {
        let meta_path = sidecar_path(path);
        if options == &PutOptions::default() {
            return match tokio::fs::remove_file(&meta_path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        }
        let json = serde_json::to_vec_pretty(options)
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        tokio::fs::write(meta_path, json).await
    }

    /// Read back an object and its put options (for testing)
    pub fn read_object(&self, bucket: &str, key: &str) -> IoResult<(Vec<u8>, PutOptions)> {
        let path = self.bucket_dir(bucket)?.join(key);
        let data = std::fs::read(&path)?;
        let options = match std::fs::read(sidecar_path(&path)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => PutOptions::default(),
            Err(e) => return Err(e),
        };
        Ok((data, options))
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(META_SUFFIX);
    PathBuf::from(os)
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        data: &'a [u8],
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.object_path(bucket, key)?;
            tokio::fs::write(&path, data).await?;
            Self::write_meta(&path, options).await
        })
    }

    fn put_stream<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        mut reader: ObjectReader,
        size: u64,
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.object_path(bucket, key)?;
            let mut file = tokio::fs::File::create(&path).await?;
            let copied = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            if copied != size {
                return Err(IoError::new(
                    ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, copied {}", size, copied),
                ));
            }
            Self::write_meta(&path, options).await
        })
    }

    fn list<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>> {
        Box::pin(async move {
            let base = self.bucket_dir(bucket)?;
            let mut objects = Vec::new();

            fn walk_dir(
                dir: &Path,
                base: &Path,
                prefix: &str,
                objects: &mut Vec<ObjectMeta>,
            ) -> IoResult<()> {
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    let path = entry.path();

                    if path.is_dir() {
                        walk_dir(&path, base, prefix, objects)?;
                    } else if path.is_file() {
                        let Ok(relative) = path.strip_prefix(base) else {
                            continue;
                        };
                        let key = relative.to_string_lossy().to_string();
                        if key.starts_with(prefix) && !key.ends_with(META_SUFFIX) {
                            let metadata = std::fs::metadata(&path)?;
                            objects.push(ObjectMeta {
                                key,
                                size_bytes: metadata.len(),
                                created_at_ms: metadata
                                    .modified()
                                    .ok()
                                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                                    .map(|d| d.as_millis() as u64)
                                    .unwrap_or(0),
                            });
                        }
                    }
                }
                Ok(())
            }

            walk_dir(&base, &base, prefix, &mut objects)?;
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(ListResult { objects })
        })
    }

    fn head_bucket<'a>(
        &'a self,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move { self.bucket_dir(bucket).map(|_| ()) })
    }
}
