//! S3 Object Store Implementation
//!
//! Uses the `object_store` crate from the Arrow ecosystem. One client is built
//! per configured bucket.
//!
//! Supports:
//! - AWS S3
//! - S3-compatible services (MinIO, LocalStack, etc.)
//! - Custom endpoints

use super::config::S3Config;
use super::object_store::{ListResult, ObjectMeta, ObjectReader, ObjectStore, PutOptions};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore as ObjectStoreTrait, PutMultipartOpts,
    PutPayload, WriteMultipart,
};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Bodies at or below this size are sent with a single PUT
const MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;
const MULTIPART_CHUNK: usize = 5 * 1024 * 1024;
const MAX_CONCURRENT_PARTS: usize = 4;

/// S3 Object Store for production deployments
#[derive(Clone)]
pub struct S3ObjectStore {
    buckets: HashMap<String, Arc<dyn ObjectStoreTrait>>,
}

impl S3ObjectStore {
    /// Build a client for each bucket
    ///
    /// Credentials come from the config, falling back to
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
    pub fn new<'b>(config: &S3Config, buckets: impl IntoIterator<Item = &'b str>) -> IoResult<Self> {
        let access_key = config
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok());
        let secret_key = config
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok());

        let mut clients: HashMap<String, Arc<dyn ObjectStoreTrait>> = HashMap::new();
        for bucket in buckets {
            if clients.contains_key(bucket) {
                continue;
            }
            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(&config.region);

            if let Some(endpoint) = &config.endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            if let Some(key) = &access_key {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = &secret_key {
                builder = builder.with_secret_access_key(secret);
            }

            let store = builder.build().map_err(|e| {
                IoError::new(
                    ErrorKind::InvalidInput,
                    format!("Failed to create S3 client for {}: {}", bucket, e),
                )
            })?;
            clients.insert(bucket.to_string(), Arc::new(store));
        }

        Ok(S3ObjectStore { buckets: clients })
    }

    /// Create from existing object stores (for testing)
    pub fn from_stores(buckets: HashMap<String, Arc<dyn ObjectStoreTrait>>) -> Self {
        S3ObjectStore { buckets }
    }

    fn client(&self, bucket: &str) -> IoResult<&Arc<dyn ObjectStoreTrait>> {
        self.buckets.get(bucket).ok_or_else(|| {
            IoError::new(
                ErrorKind::NotFound,
                format!("Bucket not configured: {}", bucket),
            )
        })
    }

    /// Convert object_store errors to IoError
    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => IoError::new(ErrorKind::NotFound, err.to_string()),
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::InvalidInput, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }
}

fn attributes(options: &PutOptions) -> Attributes {
    let mut attributes = Attributes::new();
    if let Some(content_type) = &options.content_type {
        attributes.insert(Attribute::ContentType, AttributeValue::from(content_type.clone()));
    }
    for (key, value) in &options.metadata {
        attributes.insert(
            Attribute::Metadata(key.clone().into()),
            AttributeValue::from(value.clone()),
        );
    }
    attributes
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buckets: Vec<&String> = self.buckets.keys().collect();
        buckets.sort();
        f.debug_struct("S3ObjectStore")
            .field("buckets", &buckets)
            .finish()
    }
}

impl ObjectStore for S3ObjectStore {
    fn put<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        data: &'a [u8],
        options: &'a PutOptions,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client(bucket)?;
            let opts = object_store::PutOptions {
                attributes: attributes(options),
                ..Default::default()
            };
            client
                .put_opts(
                    &ObjectPath::from(key),
                    PutPayload::from(bytes::Bytes::copy_from_slice(data)),
                    opts,
                )
                .await
                .map_err(Self::map_error)?;
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
            if size <= MULTIPART_THRESHOLD {
                let mut data = Vec::with_capacity(size as usize);
                reader.read_to_end(&mut data).await?;
                return self.put(bucket, key, &data, options).await;
            }

            let client = self.client(bucket)?;
            let upload = client
                .put_multipart_opts(
                    &ObjectPath::from(key),
                    PutMultipartOpts {
                        attributes: attributes(options),
                        ..Default::default()
                    },
                )
                .await
                .map_err(Self::map_error)?;
            let mut writer = WriteMultipart::new_with_chunk_size(upload, MULTIPART_CHUNK);

            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = writer.abort().await;
                        return Err(e);
                    }
                };
                if n == 0 {
                    break;
                }
                if let Err(e) = writer.wait_for_capacity(MAX_CONCURRENT_PARTS).await {
                    let _ = writer.abort().await;
                    return Err(Self::map_error(e));
                }
                writer.write(&buf[..n]);
            }

            writer.finish().await.map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ListResult>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client(bucket)?;
            let prefix_path = ObjectPath::from(prefix);
            let listed: Vec<_> = client
                .list(Some(&prefix_path))
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let mut objects: Vec<ObjectMeta> = listed
                .into_iter()
                .map(|meta| ObjectMeta {
                    key: meta.location.to_string(),
                    size_bytes: meta.size as u64,
                    created_at_ms: meta.last_modified.timestamp_millis().try_into().unwrap_or(0),
                })
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(ListResult { objects })
        })
    }

    fn head_bucket<'a>(
        &'a self,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client(bucket)?;
            client
                .list_with_delimiter(None)
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }
}
