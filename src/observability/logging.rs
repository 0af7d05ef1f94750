//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! The output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON format for production and log aggregation systems
//! - `pretty` - Human-readable format with colors and indentation for development
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO,
//!   or DEBUG when `DEBUG` is set to a non-empty value
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Failure records
//!
//! Failure branches of the task cycle log with a `reason` field
//! (`GET_TASK`, `HANDLE_SINGLE_FILE`, `GROUP_TASK`, `DOWNLOADING_CACHE`,
//! `REMOVING_CACHE`, `SUBMIT_RESULTS`, `STORE_GROUP_OUTPUT`) so they can be
//! grouped without parsing messages.
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./pipeline-plugin run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies held at `warn` unless `RUST_LOG` says otherwise
const QUIET_TARGETS: [&str; 4] = ["hyper", "reqwest", "object_store", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string, defaulting to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolve the log level from `LOG_LEVEL` and the `DEBUG` flag
///
/// An explicit `LOG_LEVEL` wins; otherwise `DEBUG` raises the default to DEBUG.
pub fn resolve_level(log_level: Option<&str>, debug: bool) -> Level {
    match log_level.map(str::to_uppercase).as_deref() {
        Some("ERROR") => Level::ERROR,
        Some("WARN") => Level::WARN,
        Some("INFO") => Level::INFO,
        Some("DEBUG") => Level::DEBUG,
        Some("TRACE") => Level::TRACE,
        _ if debug => Level::DEBUG,
        _ => Level::INFO,
    }
}

/// Filter directives for `level` with noisy dependencies quieted
fn filter_directives(level: Level) -> String {
    let mut directives = level.to_string().to_lowercase();
    for target in QUIET_TARGETS {
        directives.push_str(&format!(",{target}=warn"));
    }
    directives
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => EnvFilter::new(filter_directives(level)),
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let debug = env::var("DEBUG").map(|v| !v.is_empty()).unwrap_or(false);
    let level = resolve_level(env::var("LOG_LEVEL").ok().as_deref(), debug);

    let format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let log_format = LogFormat::parse(&format);

    let include_spans = env::var("LOG_SPANS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    init_logging(level, log_format, include_spans);
}

/// Create a span covering one task from dispatch to report
#[macro_export]
macro_rules! task_span {
    ($($field:tt)*) => {
        tracing::info_span!("task", $($field)*)
    };
}

/// Create a span covering one acquisition cycle
#[macro_export]
macro_rules! cycle_span {
    ($($field:tt)*) => {
        tracing::debug_span!("cycle", $($field)*)
    };
}

pub use {cycle_span, task_span};
