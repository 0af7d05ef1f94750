//! Group output aggregation
//!
//! A [`GroupWriter`] is created per task. Fragments are appended to a local
//! staging file as bulk-update records; [`store`](OutputAggregator::store)
//! rebuilds them into a rollup file, uploads it to the blob store under
//! `<jobId>/<taskId>/group/<pluginId>.bin` and returns the `storePayloads`
//! list the next workflow stage should see.
//!
//! ```text
//! append_task_output ──► task-<id>.ndjson ─┐
//!                                          ├─► group-<id>.ndjson ──► blob store
//! write_group_output ──► (group record) ───┘
//! ```

use crate::config::{IndexSection, StageConfig};
use crate::protocol::TaskMetadata;
use crate::storage::{BlobStore, StorageError, OCTET_STREAM};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

pub mod records;

pub use records::StorageMeta;

/// Metadata field carrying the object keys of earlier stages
pub const STORE_PAYLOADS_FIELD: &str = "storePayloads";

/// Aggregation errors
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("fragment has no @id")]
    MissingFragmentId,
    #[error("failed to encode bulk record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write staging file {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build rollup {}: {source}", path.display())]
    Handoff {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to upload rollup '{key}': {source}")]
    Upload {
        key: String,
        #[source]
        source: StorageError,
    },
}

impl WriterError {
    fn staging(path: &Path, source: std::io::Error) -> Self {
        Self::Staging {
            path: path.to_path_buf(),
            source,
        }
    }

    fn handoff(path: &Path, source: std::io::Error) -> Self {
        Self::Handoff {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of a successful [`store`](OutputAggregator::store)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredOutput {
    /// Key the rollup was uploaded under
    #[serde(skip)]
    pub key: String,
    /// Keys of every stage so far, this one last
    #[serde(rename = "storePayloads")]
    pub store_payloads: Vec<String>,
}

impl StoredOutput {
    /// `{"storePayloads": [...]}`, ready to be returned by a group handler
    pub fn into_metadata(self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert(
            STORE_PAYLOADS_FIELD.to_string(),
            Value::from(self.store_payloads),
        );
        metadata
    }
}

/// Accumulates group-scoped output and hands it to the blob store
#[async_trait]
pub trait OutputAggregator: Send {
    /// Append one fragment record to local staging
    async fn append_task_output(&mut self, fragment: &Value) -> Result<(), WriterError>;

    /// Stage the task-level group record
    async fn write_group_output(&mut self, group_output: &Value) -> Result<(), WriterError>;

    /// Upload everything staged so far; consumes the aggregator
    async fn store(self) -> Result<StoredOutput, WriterError>
    where
        Self: Sized;
}

/// Object key of the rollup for one task and plugin
pub fn rollup_key(job_id: &str, task_id: &str, plugin_id: &str) -> String {
    format!("{job_id}/{task_id}/group/{plugin_id}.bin")
}

/// Make `id` usable as a file name component
fn file_component(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File-backed [`OutputAggregator`] uploading to a [`BlobStore`]
pub struct GroupWriter {
    meta: StorageIds,
    existing_payloads: Vec<String>,
    plugin_id: String,
    index: IndexSection,
    store: Arc<dyn BlobStore>,
    fragment_path: PathBuf,
    rollup_path: PathBuf,
    fragments: BufWriter<File>,
    fragment_count: usize,
}

#[derive(Debug, Clone)]
struct StorageIds {
    user_id: String,
    project_id: String,
    job_id: String,
    task_id: String,
}

impl std::fmt::Debug for GroupWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupWriter")
            .field("task_id", &self.meta.task_id)
            .field("plugin_id", &self.plugin_id)
            .field("fragment_path", &self.fragment_path)
            .field("fragment_count", &self.fragment_count)
            .finish()
    }
}

impl GroupWriter {
    /// Open a fresh fragment file for the task described by `metadata`
    ///
    /// Staging files live in the configured staging directory. A file left
    /// behind by an earlier attempt at the same task is truncated.
    pub async fn create(
        metadata: &TaskMetadata,
        stage: &StageConfig,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self, WriterError> {
        let config = stage.base();
        let staging_dir = config.cache.staging_path.clone();
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| WriterError::staging(&staging_dir, e))?;

        let task_id = metadata.task.id.clone();
        let component = file_component(&task_id);
        let fragment_path = staging_dir.join(format!("task-{component}.ndjson"));
        let rollup_path = staging_dir.join(format!("group-{component}.ndjson"));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&fragment_path)
            .await
            .map_err(|e| WriterError::staging(&fragment_path, e))?;
        // a group record staged by an earlier attempt must not leak into this one
        for stale in [rollup_path.clone(), partial_path(&rollup_path)] {
            remove_if_exists(&stale)
                .await
                .map_err(|e| WriterError::staging(&stale, e))?;
        }

        debug!(task_id = %task_id, path = %fragment_path.display(), "Opened fragment staging file");

        Ok(Self {
            meta: StorageIds {
                user_id: metadata.user.id.clone(),
                project_id: metadata.project.id.clone(),
                job_id: metadata.job.id.clone(),
                task_id,
            },
            existing_payloads: metadata.store_payloads().to_vec(),
            plugin_id: config.controller.plugin_id.clone(),
            index: stage.index(),
            store,
            fragment_path,
            rollup_path,
            fragments: BufWriter::new(file),
            fragment_count: 0,
        })
    }

    /// Key the rollup will be uploaded under
    pub fn object_key(&self) -> String {
        rollup_key(&self.meta.job_id, &self.meta.task_id, &self.plugin_id)
    }

    pub fn fragment_path(&self) -> &Path {
        &self.fragment_path
    }

    pub fn rollup_path(&self) -> &Path {
        &self.rollup_path
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    fn storage_meta(&self) -> StorageMeta {
        StorageMeta {
            user_id: self.meta.user_id.clone(),
            project_id: self.meta.project_id.clone(),
            job_id: self.meta.job_id.clone(),
            task_id: self.meta.task_id.clone(),
            stored_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Sibling file the rollup is assembled in before replacing the group file
    fn partial_path(&self) -> PathBuf {
        partial_path(&self.rollup_path)
    }

    /// Build the rollup: fragment records in append order, then the group record
    ///
    /// The rollup is assembled in a `.part` file and renamed over the group
    /// file once synced, so a failed hand-off leaves the staged group record
    /// untouched.
    async fn build_rollup(&mut self) -> Result<(), WriterError> {
        self.fragments
            .flush()
            .await
            .map_err(|e| WriterError::handoff(&self.fragment_path, e))?;
        self.fragments
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| WriterError::handoff(&self.fragment_path, e))?;

        let partial = self.partial_path();
        if let Err(e) = self.assemble(&partial).await {
            if let Err(remove_error) = remove_if_exists(&partial).await {
                warn!(path = %partial.display(), error = %remove_error, "Failed to remove partial rollup");
            }
            return Err(e);
        }

        tokio::fs::rename(&partial, &self.rollup_path)
            .await
            .map_err(|e| WriterError::handoff(&self.rollup_path, e))
    }

    async fn assemble(&self, partial: &Path) -> Result<(), WriterError> {
        let mut rollup = File::create(partial)
            .await
            .map_err(|e| WriterError::handoff(partial, e))?;

        let mut fragments = File::open(&self.fragment_path)
            .await
            .map_err(|e| WriterError::handoff(&self.fragment_path, e))?;
        let fragment_bytes = tokio::io::copy(&mut fragments, &mut rollup)
            .await
            .map_err(|e| WriterError::handoff(&self.fragment_path, e))?;

        let group_bytes = match File::open(&self.rollup_path).await {
            Ok(mut group) => tokio::io::copy(&mut group, &mut rollup)
                .await
                .map_err(|e| WriterError::handoff(&self.rollup_path, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(WriterError::handoff(&self.rollup_path, e)),
        };

        rollup
            .flush()
            .await
            .map_err(|e| WriterError::handoff(partial, e))?;
        rollup
            .sync_all()
            .await
            .map_err(|e| WriterError::handoff(partial, e))?;

        debug!(
            task_id = %self.meta.task_id,
            fragment_bytes,
            group_bytes,
            "Rollup built"
        );
        Ok(())
    }
}

fn partial_path(rollup_path: &Path) -> PathBuf {
    let mut name = rollup_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl OutputAggregator for GroupWriter {
    async fn append_task_output(&mut self, fragment: &Value) -> Result<(), WriterError> {
        let record = records::fragment_record(fragment, &self.meta.task_id, &self.index)?;
        self.fragments
            .write_all(record.as_bytes())
            .await
            .map_err(|e| WriterError::staging(&self.fragment_path, e))?;
        self.fragment_count += 1;
        Ok(())
    }

    async fn write_group_output(&mut self, group_output: &Value) -> Result<(), WriterError> {
        let record = records::group_record(group_output, &self.storage_meta(), &self.index)?;
        tokio::fs::write(&self.rollup_path, record.as_bytes())
            .await
            .map_err(|e| WriterError::staging(&self.rollup_path, e))
    }

    async fn store(mut self) -> Result<StoredOutput, WriterError> {
        let key = self.object_key();

        if let Err(e) = self.build_rollup().await {
            error!(reason = "STORE_GROUP_OUTPUT", task_id = %self.meta.task_id, error = %e, "Failed to build rollup");
            return Err(e);
        }

        if let Err(source) = self
            .store
            .put_file(&key, &self.rollup_path, OCTET_STREAM)
            .await
        {
            error!(
                reason = "STORE_GROUP_OUTPUT",
                task_id = %self.meta.task_id,
                key = %key,
                error = %source,
                "Failed to upload rollup, staging files kept"
            );
            return Err(WriterError::Upload { key, source });
        }

        let GroupWriter {
            mut existing_payloads,
            fragments,
            fragment_path,
            rollup_path,
            fragment_count,
            meta,
            ..
        } = self;
        drop(fragments);

        for path in [&fragment_path, &rollup_path] {
            if let Err(e) = remove_if_exists(path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove staging file");
            }
        }

        info!(
            task_id = %meta.task_id,
            key = %key,
            fragments = fragment_count,
            "Group output stored"
        );

        existing_payloads.push(key.clone());
        Ok(StoredOutput {
            key,
            store_payloads: existing_payloads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::protocol::{EntityRef, JobInfo, TaskInfo, TaskOptions, Workflow, WorkflowType};
    use crate::testing::mocks::MemoryBlobStore;
    use serde_json::json;

    fn metadata(store_payloads: Vec<String>) -> TaskMetadata {
        TaskMetadata {
            job: JobInfo {
                id: "job-1".to_string(),
                workflow: Workflow {
                    kind: WorkflowType::Group,
                    steps: Vec::new(),
                },
                extra: Map::new(),
            },
            task: TaskInfo {
                id: "task-1".to_string(),
                metadata: Some(TaskOptions {
                    store_payloads,
                    ..Default::default()
                }),
                extra: Map::new(),
            },
            project: EntityRef::new("project-1"),
            user: EntityRef::new("user-1"),
            extra: Map::new(),
        }
    }

    fn stage(staging: &Path) -> StageConfig {
        let mut config = PluginConfig::test_config();
        config.cache.staging_path = staging.to_path_buf();
        StageConfig::base_only(Arc::new(config))
    }

    #[test]
    fn test_rollup_key() {
        assert_eq!(rollup_key("j", "t", "ner"), "j/t/group/ner.bin");
    }

    #[test]
    fn test_file_component_replaces_separators() {
        assert_eq!(file_component("a/b:c"), "a_b_c");
        assert_eq!(file_component("task-1.x"), "task-1.x");
    }

    #[tokio::test]
    async fn test_store_uploads_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new("pipeline"));
        let mut writer = GroupWriter::create(&metadata(vec![]), &stage(dir.path()), store.clone())
            .await
            .unwrap();

        writer
            .append_task_output(&json!({"@id": "d1"}))
            .await
            .unwrap();
        let fragment_path = writer.fragment_path().to_path_buf();
        let rollup_path = writer.rollup_path().to_path_buf();

        let stored = writer.store().await.unwrap();

        assert_eq!(stored.key, "job-1/task-1/group/test-plugin.bin");
        assert_eq!(stored.store_payloads, vec![stored.key.clone()]);
        assert!(store.object(&stored.key).is_some());
        assert_eq!(store.content_type(&stored.key).as_deref(), Some(OCTET_STREAM));
        assert!(!fragment_path.exists());
        assert!(!rollup_path.exists());
    }

    #[tokio::test]
    async fn test_store_appends_to_existing_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new("pipeline"));
        let writer = GroupWriter::create(
            &metadata(vec!["a/b.bin".to_string()]),
            &stage(dir.path()),
            store,
        )
        .await
        .unwrap();

        let metadata = writer.store().await.unwrap().into_metadata();

        assert_eq!(
            Value::Object(metadata),
            json!({"storePayloads": ["a/b.bin", "job-1/task-1/group/test-plugin.bin"]})
        );
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new("pipeline"));
        store.set_should_fail(true);
        let mut writer = GroupWriter::create(&metadata(vec![]), &stage(dir.path()), store.clone())
            .await
            .unwrap();
        writer
            .append_task_output(&json!({"@id": "d1"}))
            .await
            .unwrap();
        let fragment_path = writer.fragment_path().to_path_buf();
        let rollup_path = writer.rollup_path().to_path_buf();

        let err = writer.store().await.unwrap_err();

        assert!(matches!(err, WriterError::Upload { .. }));
        assert!(fragment_path.exists());
        assert!(rollup_path.exists());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_create_discards_stale_staging() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("task-task-1.ndjson"), b"stale\n").unwrap();
        std::fs::write(dir.path().join("group-task-1.ndjson"), b"stale\n").unwrap();
        let store = Arc::new(MemoryBlobStore::new("pipeline"));

        let writer = GroupWriter::create(&metadata(vec![]), &stage(dir.path()), store.clone())
            .await
            .unwrap();
        let stored = writer.store().await.unwrap();

        assert!(store.object(&stored.key).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fragment_without_id_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new("pipeline"));
        let mut writer = GroupWriter::create(&metadata(vec![]), &stage(dir.path()), store)
            .await
            .unwrap();

        let err = writer
            .append_task_output(&json!({"text": "no id"}))
            .await
            .unwrap_err();

        assert!(matches!(err, WriterError::MissingFragmentId));
        assert_eq!(writer.fragment_count(), 0);
    }
}
