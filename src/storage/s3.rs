//! S3-compatible blob store

use crate::config::PluginConfig;
use crate::storage::{BlobStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutMultipartOpts, WriteMultipart,
};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use url::Url;

/// Read buffer for streaming uploads
const UPLOAD_READ_CHUNK: usize = 1024 * 1024;

/// Parts in flight per multipart upload
const UPLOAD_CONCURRENCY: usize = 4;

/// Blob store backed by an S3-compatible endpoint
#[derive(Debug)]
pub struct S3BlobStore {
    store: AmazonS3,
    bucket: String,
}

impl S3BlobStore {
    /// Build a store from the `object_store` section of the configuration
    pub fn new(config: &PluginConfig) -> Result<Self, StorageError> {
        let section = &config.object_store;
        let store = AmazonS3Builder::new()
            .with_endpoint(config.object_store_endpoint())
            .with_region(section.region.clone())
            .with_bucket_name(section.bucket.clone())
            .with_access_key_id(section.access_key.clone())
            .with_secret_access_key(section.secret_key.clone())
            .with_allow_http(section.scheme == "http")
            .build()
            .map_err(|e| StorageError::Config {
                message: e.to_string(),
            })?;

        Ok(Self {
            store,
            bucket: section.bucket.clone(),
        })
    }

    async fn stream_file(
        &self,
        upload: &mut WriteMultipart,
        local_path: &Path,
    ) -> Result<u64, StorageError> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut buffer = vec![0u8; UPLOAD_READ_CHUNK];
        let mut total = 0u64;

        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                return Ok(total);
            }
            upload
                .wait_for_capacity(UPLOAD_CONCURRENCY)
                .await
                .map_err(map_backend_error)?;
            upload.write(&buffer[..read]);
            total += read as u64;
        }
    }
}

fn map_backend_error(error: object_store::Error) -> StorageError {
    StorageError::backend(error.to_string())
}

fn map_key_error(key: &str, error: object_store::Error) -> StorageError {
    match error {
        object_store::Error::NotFound { .. } => StorageError::NotFound {
            key: key.to_string(),
        },
        other => map_backend_error(other),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_file(
        &self,
        key: &str,
        local_path: &Path,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );
        let opts = PutMultipartOpts {
            attributes,
            ..Default::default()
        };

        let location = ObjectPath::from(key);
        let upload = self
            .store
            .put_multipart_opts(&location, opts)
            .await
            .map_err(map_backend_error)?;
        let mut writer = WriteMultipart::new(upload);

        match self.stream_file(&mut writer, local_path).await {
            Ok(bytes) => {
                writer.finish().await.map_err(map_backend_error)?;
                debug!(bucket = %self.bucket, key, bytes, "Uploaded object");
                Ok(())
            }
            Err(error) => {
                if let Err(abort_error) = writer.abort().await {
                    warn!(key, error = %abort_error, "Failed to abort multipart upload");
                }
                Err(error)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let location = ObjectPath::from(key);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_key_error(key, e))?;
        result.bytes().await.map_err(|e| map_key_error(key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let location = ObjectPath::from(key);
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(other) => Err(map_backend_error(other)),
        }
    }

    async fn presigned_get_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<Url, StorageError> {
        let location = ObjectPath::from(key);
        self.store
            .signed_url(http::Method::GET, &location, expires_in)
            .await
            .map_err(map_backend_error)
    }

    async fn presigned_put_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<Url, StorageError> {
        let location = ObjectPath::from(key);
        self.store
            .signed_url(http::Method::PUT, &location, expires_in)
            .await
            .map_err(map_backend_error)
    }
}
