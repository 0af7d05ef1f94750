//! Error types for the plugin runtime
//!
//! Each boundary has its own error enum; [`PluginError`] wraps them and maps
//! every failure onto an [`ErrorKind`] that decides how the task cycle reacts.

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::transport::TransportError;
use crate::writer::WriterError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Error returned by caller-supplied handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Message reported when a failure carries no text
pub const UNKNOWN_ERROR_MESSAGE: &str = "An unknown error occurred";

/// Failure classes driving retry and reporting behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused: retried with exponential backoff
    TransportUnavailable,
    /// Any other transport failure: retried on a fixed delay
    TransportTransient,
    /// No task ready: not an error, drives the idle loop
    NotFound,
    /// Caller logic failed: reported as `status=failure`
    HandlerFailure,
    /// Cache download or extraction failed: handler is skipped, failure reported
    CacheFailure,
    /// Group output staging or upload failed
    AggregationFailure,
    Configuration,
    InvalidTask,
}

/// Main error type for plugin runtime operations
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Handler failed: {message}")]
    HandlerFailure { message: String },

    #[error("No handler registered for {0} tasks")]
    MissingHandler(String),

    #[error("Invalid task: {message}")]
    InvalidTask { message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Group output error: {0}")]
    Writer(#[from] WriterError),

    #[error("Object store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PluginError {
    /// Classify this error per the runtime's failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::HandlerFailure { .. } | PluginError::MissingHandler(_) => {
                ErrorKind::HandlerFailure
            }
            PluginError::InvalidTask { .. } => ErrorKind::InvalidTask,
            PluginError::Transport(TransportError::Unavailable { .. }) => {
                ErrorKind::TransportUnavailable
            }
            PluginError::Transport(TransportError::NotFound) => ErrorKind::NotFound,
            PluginError::Transport(_) => ErrorKind::TransportTransient,
            PluginError::Cache(_) => ErrorKind::CacheFailure,
            PluginError::Writer(_) | PluginError::Storage(_) => ErrorKind::AggregationFailure,
            PluginError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Wrap a handler error, keeping only its message
    pub fn handler_failure(error: &HandlerError) -> Self {
        Self::HandlerFailure {
            message: error.to_string(),
        }
    }

    pub fn invalid_task<S: Into<String>>(message: S) -> Self {
        Self::InvalidTask {
            message: message.into(),
        }
    }

    /// Text suitable for the `error` field of a result payload
    ///
    /// Handler messages are reported as written; runtime failures, which can
    /// carry URLs and local paths, are sanitized.
    pub fn report_message(&self) -> String {
        match self {
            PluginError::HandlerFailure { message } => handler_message(message),
            other => report_message(&other.to_string()),
        }
    }
}

fn handler_message(message: &str) -> String {
    if message.trim().is_empty() {
        UNKNOWN_ERROR_MESSAGE.to_string()
    } else {
        message.to_string()
    }
}

/// Sanitize a failure message before it leaves the process
///
/// Empty messages become [`UNKNOWN_ERROR_MESSAGE`].
pub fn report_message(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return UNKNOWN_ERROR_MESSAGE.to_string();
    }
    sanitize_error_message(trimmed)
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid path pattern")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials and sensitive paths, truncate to 500 bytes
fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for plugin runtime operations
pub type PluginResult<T> = Result<T, PluginError>;
