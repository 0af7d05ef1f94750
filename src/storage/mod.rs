//! Object store access
//!
//! Group output is handed to downstream stages through a key-addressed blob
//! store. The runtime only needs a handful of operations, captured by
//! [`BlobStore`]; [`S3BlobStore`] implements them against any S3-compatible
//! endpoint (MinIO in the usual deployment).

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub mod s3;

pub use s3::S3BlobStore;

/// Content type used for group rollup uploads
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Default lifetime of presigned URLs
pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Object store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object '{key}' not found")]
    NotFound { key: String },
    #[error("failed to read local file: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store request failed: {message}")]
    Backend { message: String },
    #[error("object store misconfigured: {message}")]
    Config { message: String },
}

impl StorageError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Key-addressed blob store bound to a single bucket
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bucket all keys are resolved in
    fn bucket(&self) -> &str;

    /// Upload the file at `local_path` under `key`
    async fn put_file(
        &self,
        key: &str,
        local_path: &Path,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Download the object stored under `key`
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Whether an object exists under `key`
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// URL granting temporary read access to `key`
    async fn presigned_get_url(&self, key: &str, expires_in: Duration)
        -> Result<Url, StorageError>;

    /// URL granting temporary write access to `key`
    async fn presigned_put_url(&self, key: &str, expires_in: Duration)
        -> Result<Url, StorageError>;
}
