//! Transport layer for controller communication
//!
//! This module provides the controller abstraction, its HTTP implementation,
//! and the retry policy shared by every controller call.

use crate::protocol::{ResultPayload, Task};
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

pub mod http;
pub mod retry;

pub use http::HttpController;
pub use retry::{RetryPolicy, RetryingTransport};

/// Classified transport failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Connection refused or upstream unavailable
    #[error("controller unavailable: {message}")]
    Unavailable { message: String },
    /// Any other network or HTTP failure
    #[error("transient transport failure: {message}")]
    Transient { message: String },
    /// The requested resource does not exist
    #[error("not found")]
    NotFound,
    /// Not worth retrying: malformed body, unbuildable request
    #[error("fatal transport failure: {message}")]
    Fatal { message: String },
}

impl TransportError {
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// File attached to a task out of band
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub identifier: String,
    pub metadata: Value,
    pub bytes: Bytes,
}

/// Controller abstraction
///
/// Implementations perform a single attempt per call and classify failures;
/// retrying is the caller's job (see [`RetryingTransport`]).
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Fetch the next task for this plugin instance, `None` when nothing is ready
    async fn fetch_task(&self) -> Result<Option<Task>, TransportError>;

    /// Submit the outcome of `task_id`
    async fn submit_result(
        &self,
        task_id: &str,
        payload: &ResultPayload,
    ) -> Result<(), TransportError>;

    /// Attach a file to `task_id`
    async fn upload_file(&self, task_id: &str, upload: &FileUpload)
        -> Result<(), TransportError>;
}
