#![forbid(unsafe_code)]

//! Durable object storage for processed videos.

use std::{pin::Pin, sync::Arc, time::Instant};

use async_trait::async_trait;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, ObjectStoreExt, aws::AmazonS3Builder,
    buffered::BufWriter, path::Path as ObjectPath,
};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{IngestError, IngestResult};
use crate::naming::StorageKey;

pub type AssetBody = Pin<Box<dyn AsyncRead + Send + Unpin>>;

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Bucket every key is written into.
    fn bucket(&self) -> &str;

    /// Streams `body` into `key`. The object is only visible once this
    /// returns `Ok`.
    async fn put(&self, key: &StorageKey, body: AssetBody, content_type: &str) -> IngestResult<()>;

    /// Removes `key`; used to roll back an upload whose record update failed.
    async fn delete(&self, key: &StorageKey) -> IngestResult<()>;
}

/// `AssetStore` over any `object_store` backend (S3 in production, in-memory
/// in tests).
#[derive(Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    part_size: usize,
}

/// Bodies up to this size go out as a single PUT; larger ones switch to a
/// multipart upload with parts of this size.
pub const DEFAULT_PART_SIZE: usize = 10 * 1024 * 1024;

impl ObjectStorage {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    /// Builds an S3 client from the ambient AWS environment plus explicit
    /// bucket/region, optionally pointed at an S3-compatible endpoint.
    pub fn s3(bucket: &str, region: &str, endpoint: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region)
            .with_bucket_name(bucket);

        if let Some(endpoint) = endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build()?;
        Ok(Self::new(Arc::new(store), bucket))
    }
}

#[async_trait]
impl AssetStore for ObjectStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(
        &self,
        key: &StorageKey,
        mut body: AssetBody,
        content_type: &str,
    ) -> IngestResult<()> {
        let start = Instant::now();
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );
        let mut writer = BufWriter::with_capacity(
            Arc::clone(&self.store),
            ObjectPath::from(key.as_str()),
            self.part_size,
        )
        .with_attributes(attributes);

        let copied = match tokio::io::copy(&mut body, &mut writer).await {
            Ok(size) => writer.shutdown().await.map(|()| size),
            Err(err) => Err(err),
        };

        let size = match copied {
            Ok(size) => size,
            Err(err) => {
                if let Err(abort) = writer.abort().await {
                    tracing::warn!(error = %abort, key = %key, "failed to abort partial upload");
                }
                tracing::error!(
                    error = %err,
                    bucket = %self.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "object upload failed"
                );
                return Err(IngestError::StorageError(format!("uploading {key}: {err}")));
            }
        };

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "object upload successful"
        );
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> IngestResult<()> {
        let location = ObjectPath::from(key.as_str());
        self.store.delete(&location).await.map_err(|err| {
            tracing::error!(error = %err, bucket = %self.bucket, key = %key, "object delete failed");
            IngestError::StorageError(format!("deleting {key}: {err}"))
        })
    }
}
