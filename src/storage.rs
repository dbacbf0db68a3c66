//! Blob storage for templates and converted documents.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::info;

/// Download/upload of whole objects between blob storage and local files.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes the object at `bucket`/`key` to `destination`.
    async fn download(&self, bucket: &str, key: &str, destination: &Path) -> Result<()>;

    /// Uploads the file at `source` to `bucket`/`key`.
    async fn upload(&self, source: &Path, bucket: &str, key: &str) -> Result<()>;
}

/// [`BlobStore`] backed by S3.
pub struct S3BlobStore {
    client: Client,
}

impl S3BlobStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn download(&self, bucket: &str, key: &str, destination: &Path) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Could not get {} from {}", key, bucket))?;

        let bytes = response
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read S3 object body for {}", key))?
            .into_bytes();

        tokio::fs::write(destination, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", destination.display()))?;

        info!(bucket, key, bytes = bytes.len(), "Downloaded object");
        Ok(())
    }

    async fn upload(&self, source: &Path, bucket: &str, key: &str) -> Result<()> {
        let body = ByteStream::from_path(source)
            .await
            .with_context(|| format!("Could not read {}", source.display()))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type("application/pdf")
            .send()
            .await
            .with_context(|| format!("Could not upload {} to {}/{}", source.display(), bucket, key))?;

        info!(bucket, key, "Uploaded object");
        Ok(())
    }
}
