//! Caller-supplied processing logic and the context it runs in

use crate::config::StageConfig;
use crate::error::{HandlerError, PluginError};
use crate::protocol::{TaskMetadata, WorkflowType};
use crate::storage::BlobStore;
use crate::transport::{Controller, FileUpload, RetryingTransport, TransportError};
use crate::writer::{GroupWriter, WriterError};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Handler for `SINGLE_FILE` tasks
///
/// Returns the transformed document, or `None` when there is nothing to
/// replace the input with.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &TaskContext,
        jsonld: Option<Value>,
        url: Option<String>,
    ) -> Result<Option<Value>, HandlerError>;
}

/// Handler for `GROUP` tasks
///
/// `cache_path` points at the extracted cache when the task carried a
/// `cacheURL`. The returned map is submitted as `additionalMetadata`.
#[async_trait]
pub trait GroupHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &TaskContext,
        cache_path: Option<&Path>,
    ) -> Result<Option<Map<String, Value>>, HandlerError>;
}

/// Registered handlers; at least one is required
#[derive(Clone, Default)]
pub struct Handlers {
    task: Option<Arc<dyn TaskHandler>>,
    group: Option<Arc<dyn GroupHandler>>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("task", &self.task.is_some())
            .field("group", &self.group.is_some())
            .finish()
    }
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_handler(mut self, handler: impl TaskHandler + 'static) -> Self {
        self.task = Some(Arc::new(handler));
        self
    }

    pub fn with_group_handler(mut self, handler: impl GroupHandler + 'static) -> Self {
        self.group = Some(Arc::new(handler));
        self
    }

    pub fn task(&self) -> Option<&Arc<dyn TaskHandler>> {
        self.task.as_ref()
    }

    pub fn group(&self) -> Option<&Arc<dyn GroupHandler>> {
        self.group.as_ref()
    }

    /// Fails when neither handler is registered
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.task.is_none() && self.group.is_none() {
            return Err(PluginError::MissingHandler(format!(
                "{} or {}",
                WorkflowType::SingleFile,
                WorkflowType::Group
            )));
        }
        Ok(())
    }
}

/// Everything a handler can reach while processing one task
pub struct TaskContext {
    metadata: TaskMetadata,
    stage: StageConfig,
    stage_index: Option<usize>,
    controller: Arc<dyn Controller>,
    transport: RetryingTransport,
    blob_store: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.metadata.task.id)
            .field("stage_index", &self.stage_index)
            .field("bucket", &self.blob_store.bucket())
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn new(
        metadata: TaskMetadata,
        stage: StageConfig,
        stage_index: Option<usize>,
        controller: Arc<dyn Controller>,
        transport: RetryingTransport,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            metadata,
            stage,
            stage_index,
            controller,
            transport,
            blob_store,
        }
    }

    pub fn metadata(&self) -> &TaskMetadata {
        &self.metadata
    }

    pub fn task_id(&self) -> &str {
        &self.metadata.task.id
    }

    /// Configuration with this stage's overrides applied
    pub fn stage(&self) -> &StageConfig {
        &self.stage
    }

    /// Position of this plugin in the task's workflow
    pub fn stage_index(&self) -> Option<usize> {
        self.stage_index
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blob_store
    }

    /// Open a group writer for this task
    pub async fn group_writer(&self) -> Result<GroupWriter, WriterError> {
        GroupWriter::create(&self.metadata, &self.stage, Arc::clone(&self.blob_store)).await
    }

    /// Attach a file to this task on the controller
    ///
    /// Retried like result submission; only fatal failures are returned.
    pub async fn add_file(
        &self,
        bytes: impl Into<Bytes>,
        identifier: impl Into<String>,
        metadata: Value,
    ) -> Result<(), TransportError> {
        let upload = FileUpload {
            identifier: identifier.into(),
            metadata,
            bytes: bytes.into(),
        };
        let controller = self.controller.as_ref();
        let task_id = self.task_id();
        let upload_ref = &upload;

        self.transport
            .call("upload_file", Duration::ZERO, move || {
                controller.upload_file(task_id, upload_ref)
            })
            .await?;

        debug!(task_id, identifier = %upload.identifier, bytes = upload.bytes.len(), "File attached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::protocol::Task;
    use crate::storage::DEFAULT_PRESIGN_EXPIRY;
    use crate::testing::mocks::{FnGroupHandler, MemoryBlobStore, MockController};
    use crate::transport::RetryPolicy;
    use serde_json::json;

    fn context() -> TaskContext {
        let task: Task = serde_json::from_value(json!({
            "metadata": {
                "job": {
                    "_id": "j-1",
                    "workflow": {
                        "type": "GROUP",
                        "steps": [
                            {"config": {"name": "test-plugin"}, "env": {"LANGUAGE": "de"}}
                        ]
                    }
                },
                "task": {"_id": "t-1"},
                "project": {"_id": "p-1"},
                "user": {"_id": "u-1"}
            }
        }))
        .unwrap();
        let config = Arc::new(PluginConfig::test_config());
        let stage = config.for_stage(&task.metadata.job.workflow);

        TaskContext::new(
            task.metadata,
            stage,
            Some(0),
            Arc::new(MockController::new()),
            RetryingTransport::new(RetryPolicy::default()),
            Arc::new(MemoryBlobStore::new("pipeline")),
        )
    }

    #[test]
    fn test_handlers_registry() {
        let handlers = Handlers::new().with_group_handler(FnGroupHandler::new(|_, _| Ok(None)));

        assert!(handlers.validate().is_ok());
        assert!(handlers.group().is_some());
        assert!(handlers.task().is_none());
    }

    #[test]
    fn test_empty_registry_is_invalid() {
        let err = Handlers::new().validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "No handler registered for SINGLE_FILE or GROUP tasks"
        );
    }

    #[tokio::test]
    async fn test_context_exposes_stage_and_store() {
        let ctx = context();

        assert_eq!(ctx.task_id(), "t-1");
        assert_eq!(ctx.stage_index(), Some(0));
        assert_eq!(ctx.stage().var("LANGUAGE").as_deref(), Some("de"));

        let url = ctx
            .blob_store()
            .presigned_get_url("j-1/t-1/group/test-plugin.bin", DEFAULT_PRESIGN_EXPIRY)
            .await
            .unwrap();
        assert!(url.as_str().contains("expires=86400"));
    }
}
