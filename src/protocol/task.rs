//! Task types as served by the controller
//!
//! A task is fetched once per cycle from `GET /v1/tasks`. Only the fields the
//! runtime acts on are typed; everything else is kept in `extra` maps so the
//! metadata handed to caller handlers is the full controller document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Unit of work fetched from the controller
///
/// # Examples
/// ```
/// use pipeline_plugin::protocol::{Task, WorkflowType};
/// use serde_json::json;
///
/// let task: Task = serde_json::from_value(json!({
///     "metadata": {
///         "job": { "_id": "j-1", "workflow": { "type": "SINGLE_FILE" } },
///         "task": { "_id": "t-1" },
///         "project": { "_id": "p-1" },
///         "user": { "_id": "u-1" }
///     },
///     "jsonld": { "@id": "x" },
///     "url": "http://f"
/// }))
/// .unwrap();
///
/// assert_eq!(task.task_id(), "t-1");
/// assert_eq!(task.workflow_type(), WorkflowType::SingleFile);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub metadata: TaskMetadata,
    /// Structured document, single-file tasks only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonld: Option<Value>,
    /// Source-file reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Task {
    pub fn task_id(&self) -> &str {
        &self.metadata.task.id
    }

    pub fn job_id(&self) -> &str {
        &self.metadata.job.id
    }

    pub fn workflow_type(&self) -> WorkflowType {
        self.metadata.job.workflow.kind
    }
}

/// Job, task, project and user records attached to a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetadata {
    pub job: JobInfo,
    pub task: TaskInfo,
    pub project: EntityRef,
    pub user: EntityRef,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskMetadata {
    /// Cache archive to download before running a group handler
    pub fn cache_url(&self) -> Option<&str> {
        self.task
            .metadata
            .as_ref()
            .and_then(|options| options.cache_url.as_deref())
            .filter(|url| !url.is_empty())
    }

    /// Object keys stored by earlier workflow stages, in stage order
    pub fn store_payloads(&self) -> &[String] {
        self.task
            .metadata
            .as_ref()
            .map(|options| options.store_payloads.as_slice())
            .unwrap_or_default()
    }
}

/// Any controller record identified by `_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRef {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EntityRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobInfo {
    #[serde(rename = "_id")]
    pub id: String,
    pub workflow: Workflow,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TaskOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-task options set by the controller and earlier stages
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskOptions {
    #[serde(rename = "cacheURL", default, skip_serializing_if = "Option::is_none")]
    pub cache_url: Option<String>,
    #[serde(
        rename = "storePayloads",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub store_payloads: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Task semantics selected by the job's workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    SingleFile,
    Group,
    #[serde(other)]
    Unsupported,
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowType::SingleFile => "SINGLE_FILE",
            WorkflowType::Group => "GROUP",
            WorkflowType::Unsupported => "UNSUPPORTED",
        };
        f.write_str(name)
    }
}

/// Ordered plugin stages a task traverses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    #[serde(rename = "type")]
    pub kind: WorkflowType,
    #[serde(default)]
    pub steps: Vec<WorkflowStage>,
}

impl Workflow {
    /// Index of the stage run by `plugin_name`
    pub fn stage_index(&self, plugin_name: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|stage| stage.config.name == plugin_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStage {
    pub config: StageDescriptor,
    /// Configuration overrides applied while this stage runs
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageDescriptor {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group_task_json() -> Value {
        json!({
            "metadata": {
                "job": {
                    "_id": "job-1",
                    "workflow": {
                        "type": "GROUP",
                        "steps": [
                            { "config": { "name": "ocr" }, "completed": true },
                            { "config": { "name": "ner" }, "env": { "LANGUAGE": "en" } }
                        ]
                    },
                    "name": "nightly"
                },
                "task": {
                    "_id": "task-1",
                    "metadata": {
                        "cacheURL": "http://cache/archive.tar.gz",
                        "storePayloads": ["job-1/task-1/group/ocr.bin"],
                        "priority": 3
                    }
                },
                "project": { "_id": "project-1" },
                "user": { "_id": "user-1", "email": "a@b.c" },
                "trace": "abc"
            }
        })
    }

    #[test]
    fn test_group_task_parsing() {
        let task: Task = serde_json::from_value(group_task_json()).unwrap();

        assert_eq!(task.workflow_type(), WorkflowType::Group);
        assert_eq!(task.job_id(), "job-1");
        assert_eq!(
            task.metadata.cache_url(),
            Some("http://cache/archive.tar.gz")
        );
        assert_eq!(
            task.metadata.store_payloads(),
            &["job-1/task-1/group/ocr.bin".to_string()]
        );
        assert!(task.jsonld.is_none());
        assert_eq!(task.metadata.job.workflow.stage_index("ner"), Some(1));
        assert_eq!(task.metadata.job.workflow.stage_index("missing"), None);
        assert!(task.metadata.job.workflow.steps[0].completed);
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let original = group_task_json();
        let task: Task = serde_json::from_value(original.clone()).unwrap();
        let back = serde_json::to_value(&task).unwrap();

        assert_eq!(back["metadata"]["trace"], "abc");
        assert_eq!(back["metadata"]["user"]["email"], "a@b.c");
        assert_eq!(back["metadata"]["job"]["name"], "nightly");
        assert_eq!(back["metadata"]["task"]["metadata"]["priority"], 3);
    }

    #[test]
    fn test_missing_task_options() {
        let mut raw = group_task_json();
        raw["metadata"]["task"] = json!({ "_id": "task-2", "metadata": null });

        let task: Task = serde_json::from_value(raw).unwrap();
        assert_eq!(task.metadata.cache_url(), None);
        assert!(task.metadata.store_payloads().is_empty());
    }

    #[test]
    fn test_empty_cache_url_is_absent() {
        let mut raw = group_task_json();
        raw["metadata"]["task"]["metadata"]["cacheURL"] = json!("");

        let task: Task = serde_json::from_value(raw).unwrap();
        assert_eq!(task.metadata.cache_url(), None);
    }

    #[test]
    fn test_unknown_workflow_type() {
        let mut raw = group_task_json();
        raw["metadata"]["job"]["workflow"]["type"] = json!("STREAMING");

        let task: Task = serde_json::from_value(raw).unwrap();
        assert_eq!(task.workflow_type(), WorkflowType::Unsupported);
    }
}
