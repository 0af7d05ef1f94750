//! Result submission

use crate::protocol::ResultPayload;
use crate::transport::{Controller, RetryingTransport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Submits result payloads to the controller
///
/// Every non-fatal failure is retried; a payload that can never be delivered
/// is retried for as long as the process lives.
#[derive(Clone)]
pub struct ResultReporter {
    controller: Arc<dyn Controller>,
    transport: RetryingTransport,
}

impl ResultReporter {
    pub fn new(controller: Arc<dyn Controller>, transport: RetryingTransport) -> Self {
        Self {
            controller,
            transport,
        }
    }

    /// Submit `payload` as the outcome of `task_id`
    pub async fn submit(&self, task_id: &str, payload: &ResultPayload) -> Result<(), TransportError> {
        let controller = self.controller.as_ref();

        self.transport
            .call("submit_result", Duration::ZERO, move || {
                controller.submit_result(task_id, payload)
            })
            .await?;

        info!(task_id, status = ?payload.status(), "Result submitted");
        Ok(())
    }
}
