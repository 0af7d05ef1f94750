//! Result payload submitted to the controller with `PUT /v1/tasks/<taskId>`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of a task as seen by the controller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Outcome record for one task
///
/// Built once per task and never modified afterwards; retries resend the same
/// value.
///
/// # Examples
/// ```
/// use pipeline_plugin::protocol::{ResultPayload, ResultStatus};
/// use serde_json::json;
///
/// let payload = ResultPayload::single_file("pod-1", Ok(Some(json!({"@id": "x"}))));
/// assert_eq!(payload.status(), ResultStatus::Success);
/// assert_eq!(
///     serde_json::to_value(&payload).unwrap(),
///     json!({"pluginInstance": "pod-1", "status": "success", "error": null, "jsonld": {"@id": "x"}})
/// );
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    plugin_instance: String,
    status: ResultStatus,
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jsonld: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    additional_metadata: Option<Map<String, Value>>,
}

impl ResultPayload {
    /// Payload for a single-file task; `Err` carries the failure message
    pub fn single_file(
        plugin_instance: impl Into<String>,
        outcome: Result<Option<Value>, String>,
    ) -> Self {
        let (status, jsonld, error) = match outcome {
            Ok(jsonld) => (ResultStatus::Success, jsonld, None),
            Err(message) => (ResultStatus::Failure, None, Some(message)),
        };

        Self {
            plugin_instance: plugin_instance.into(),
            status,
            error,
            jsonld,
            additional_metadata: None,
        }
    }

    /// Payload for a group task; `Err` carries the failure message
    pub fn group(
        plugin_instance: impl Into<String>,
        outcome: Result<Option<Map<String, Value>>, String>,
    ) -> Self {
        let (status, additional_metadata, error) = match outcome {
            Ok(metadata) => (ResultStatus::Success, metadata, None),
            Err(message) => (ResultStatus::Failure, None, Some(message)),
        };

        Self {
            plugin_instance: plugin_instance.into(),
            status,
            error,
            jsonld: None,
            additional_metadata,
        }
    }

    /// Failure payload for a task that could not be dispatched at all
    pub fn failure(plugin_instance: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin_instance: plugin_instance.into(),
            status: ResultStatus::Failure,
            error: Some(message.into()),
            jsonld: None,
            additional_metadata: None,
        }
    }

    pub fn plugin_instance(&self) -> &str {
        &self.plugin_instance
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn jsonld(&self) -> Option<&Value> {
        self.jsonld.as_ref()
    }

    pub fn additional_metadata(&self) -> Option<&Map<String, Value>> {
        self.additional_metadata.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}
