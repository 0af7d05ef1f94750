//! HTTP controller client
//!
//! Single-attempt calls against the controller's `/v1/tasks` API. Failures are
//! classified into [`TransportError`] variants so the retry layer can tell a
//! refused connection from a flaky one.

use crate::config::PluginConfig;
use crate::protocol::{ResultPayload, Task};
use crate::transport::{Controller, FileUpload, TransportError};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Controller client over HTTP
#[derive(Debug, Clone)]
pub struct HttpController {
    client: Client,
    base_uri: String,
    plugin_id: String,
    pod_name: String,
}

impl HttpController {
    /// Create a client from the plugin configuration
    pub fn new(config: &PluginConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(config.user_agent())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::fatal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_uri: config.controller.base_uri.trim_end_matches('/').to_string(),
            plugin_id: config.controller.plugin_id.clone(),
            pod_name: config.controller.pod_name.clone(),
        })
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    fn instance_query(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("pluginId", self.plugin_id.as_str()),
            ("pluginInstance", self.pod_name.as_str()),
        ]
    }

    fn task_uri(&self, task_id: &str) -> String {
        format!("{}/v1/tasks/{}", self.base_uri, task_id)
    }
}

/// Classify a reqwest failure (pure function)
pub(crate) fn classify_request_error(error: &reqwest::Error) -> TransportError {
    if error.is_builder() || error.is_decode() {
        TransportError::fatal(error.to_string())
    } else if error.is_connect() {
        TransportError::unavailable(error.to_string())
    } else {
        TransportError::transient(error.to_string())
    }
}

/// Classify a non-success HTTP status (pure function)
pub(crate) fn classify_status(status: StatusCode) -> TransportError {
    match status {
        StatusCode::NOT_FOUND => TransportError::NotFound,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            TransportError::unavailable(format!("HTTP {status}"))
        }
        _ => TransportError::transient(format!("HTTP {status}")),
    }
}

/// Map a submission status; a 404 here is not the "no task" signal
fn classify_write_status(status: StatusCode) -> TransportError {
    match classify_status(status) {
        TransportError::NotFound => TransportError::transient(format!("HTTP {status}")),
        other => other,
    }
}

#[async_trait]
impl Controller for HttpController {
    async fn fetch_task(&self) -> Result<Option<Task>, TransportError> {
        let response = self
            .client
            .get(format!("{}/v1/tasks", self.base_uri))
            .query(&self.instance_query())
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("No task ready");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_request_error(&e))?;
        let task: Task = serde_json::from_slice(&body)
            .map_err(|e| TransportError::fatal(format!("invalid task body: {e}")))?;

        Ok(Some(task))
    }

    async fn submit_result(
        &self,
        task_id: &str,
        payload: &ResultPayload,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .put(self.task_uri(task_id))
            .json(payload)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(classify_write_status(status))
        }
    }

    async fn upload_file(
        &self,
        task_id: &str,
        upload: &FileUpload,
    ) -> Result<(), TransportError> {
        let meta = json!({
            "identifier": upload.identifier,
            "metadata": upload.metadata,
        });
        let form = Form::new().text("meta", meta.to_string()).part(
            "file",
            Part::bytes(upload.bytes.to_vec()).file_name(upload.identifier.clone()),
        );

        let response = self
            .client
            .post(format!("{}/files", self.task_uri(task_id)))
            .query(&self.instance_query())
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(classify_write_status(status))
        }
    }
}
