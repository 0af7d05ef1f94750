//! Mock implementations for testing
//!
//! Provides an in-memory controller, blob store and closure-backed handlers so
//! the task cycle can be exercised without a controller or object store.

use crate::error::HandlerError;
use crate::protocol::{ResultPayload, Task, TaskMetadata};
use crate::runtime::{GroupHandler, TaskContext, TaskHandler};
use crate::storage::{BlobStore, StorageError};
use crate::transport::{Controller, FileUpload, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted controller recording everything submitted to it
///
/// Fetches pop scripted responses in order; once the script is exhausted
/// every fetch reports that no task is ready.
#[derive(Debug, Default)]
pub struct MockController {
    fetch_script: Mutex<VecDeque<Result<Option<Task>, TransportError>>>,
    submit_errors: Mutex<VecDeque<TransportError>>,
    submissions: Mutex<Vec<(String, ResultPayload)>>,
    uploads: Mutex<Vec<(String, FileUpload)>>,
    fetch_attempts: AtomicUsize,
    submit_attempts: AtomicUsize,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_task(&self, task: Task) {
        lock(&self.fetch_script).push_back(Ok(Some(task)));
    }

    pub fn push_empty(&self) {
        lock(&self.fetch_script).push_back(Ok(None));
    }

    pub fn push_fetch_error(&self, error: TransportError) {
        lock(&self.fetch_script).push_back(Err(error));
    }

    /// Fail the next submission or upload attempt with `error`
    pub fn push_submit_error(&self, error: TransportError) {
        lock(&self.submit_errors).push_back(error);
    }

    pub fn submissions(&self) -> Vec<(String, ResultPayload)> {
        lock(&self.submissions).clone()
    }

    pub fn uploads(&self) -> Vec<(String, FileUpload)> {
        lock(&self.uploads).clone()
    }

    pub fn fetch_attempts(&self) -> usize {
        self.fetch_attempts.load(Ordering::SeqCst)
    }

    pub fn submit_attempts(&self) -> usize {
        self.submit_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Controller for MockController {
    async fn fetch_task(&self) -> Result<Option<Task>, TransportError> {
        self.fetch_attempts.fetch_add(1, Ordering::SeqCst);
        lock(&self.fetch_script).pop_front().unwrap_or(Ok(None))
    }

    async fn submit_result(
        &self,
        task_id: &str,
        payload: &ResultPayload,
    ) -> Result<(), TransportError> {
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.submit_errors).pop_front() {
            return Err(error);
        }
        lock(&self.submissions).push((task_id.to_string(), payload.clone()));
        Ok(())
    }

    async fn upload_file(&self, task_id: &str, upload: &FileUpload) -> Result<(), TransportError> {
        if let Some(error) = lock(&self.submit_errors).pop_front() {
            return Err(error);
        }
        lock(&self.uploads).push((task_id.to_string(), upload.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Bytes,
    content_type: String,
}

/// In-memory blob store
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    should_fail: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Make every subsequent call fail with a backend error
    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Bytes>) {
        lock(&self.objects).insert(
            key.into(),
            StoredObject {
                bytes: bytes.into(),
                content_type: crate::storage::OCTET_STREAM.to_string(),
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).map(|o| o.bytes.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        lock(&self.objects).get(key).map(|o| o.content_type.clone())
    }

    /// Stored keys in lexical order
    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(StorageError::backend("mock blob store failure"));
        }
        Ok(())
    }

    fn presigned(&self, key: &str, method: &str, expires_in: Duration) -> Result<Url, StorageError> {
        self.check()?;
        let mut url = Url::parse(&format!("memory://{}/", self.bucket))
            .and_then(|base| base.join(key))
            .map_err(|e| StorageError::backend(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("method", method)
            .append_pair("expires", &expires_in.as_secs().to_string());
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_file(
        &self,
        key: &str,
        local_path: &Path,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.check()?;
        let bytes = tokio::fs::read(local_path).await?;
        lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                bytes: Bytes::from(bytes),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.check()?;
        self.object(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        Ok(lock(&self.objects).contains_key(key))
    }

    async fn presigned_get_url(&self, key: &str, expires_in: Duration) -> Result<Url, StorageError> {
        self.presigned(key, "GET", expires_in)
    }

    async fn presigned_put_url(&self, key: &str, expires_in: Duration) -> Result<Url, StorageError> {
        self.presigned(key, "PUT", expires_in)
    }
}

/// Task handler backed by a closure over the metadata, document and url
pub struct FnTaskHandler<F> {
    handler: F,
}

impl<F> FnTaskHandler<F>
where
    F: Fn(&TaskMetadata, Option<Value>, Option<String>) -> Result<Option<Value>, HandlerError>
        + Send
        + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> TaskHandler for FnTaskHandler<F>
where
    F: Fn(&TaskMetadata, Option<Value>, Option<String>) -> Result<Option<Value>, HandlerError>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        ctx: &TaskContext,
        jsonld: Option<Value>,
        url: Option<String>,
    ) -> Result<Option<Value>, HandlerError> {
        (self.handler)(ctx.metadata(), jsonld, url)
    }
}

/// Group handler backed by a closure over the metadata and cache path
pub struct FnGroupHandler<F> {
    handler: F,
}

impl<F> FnGroupHandler<F>
where
    F: Fn(&TaskMetadata, Option<&Path>) -> Result<Option<Map<String, Value>>, HandlerError>
        + Send
        + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> GroupHandler for FnGroupHandler<F>
where
    F: Fn(&TaskMetadata, Option<&Path>) -> Result<Option<Map<String, Value>>, HandlerError>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        ctx: &TaskContext,
        cache_path: Option<&Path>,
    ) -> Result<Option<Map<String, Value>>, HandlerError> {
        (self.handler)(ctx.metadata(), cache_path)
    }
}
