//! Observability for the plugin runtime
//!
//! Structured logging and the span macros used around tasks and cycles.

pub mod logging;

pub use logging::{init_default_logging, init_logging, resolve_level, LogFormat};

// Span macros for structured logging
pub use logging::{cycle_span, task_span};
