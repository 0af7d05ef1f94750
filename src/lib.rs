//! Pipeline plugin runtime
//!
//! A long-running worker for a controller-driven document processing
//! pipeline. The runtime pulls one task at a time from the controller, runs a
//! caller-supplied handler and reports the outcome, retrying controller calls
//! with backoff while the controller is unreachable.
//!
//! # Overview
//!
//! - Task and result types as served by the controller
//! - HTTP controller client with classified failures and retry policy
//! - Cache archive download and extraction for group tasks
//! - Group output aggregation uploaded to an S3-compatible object store
//! - Configuration from TOML or environment, with per-stage overrides
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use pipeline_plugin::error::HandlerError;
//! use pipeline_plugin::runtime::{Handlers, PluginRuntime, TaskContext, TaskHandler};
//! use pipeline_plugin::storage::S3BlobStore;
//! use pipeline_plugin::transport::HttpController;
//! use pipeline_plugin::PluginConfig;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! struct Passthrough;
//!
//! #[async_trait]
//! impl TaskHandler for Passthrough {
//!     async fn handle(
//!         &self,
//!         _ctx: &TaskContext,
//!         jsonld: Option<Value>,
//!         _url: Option<String>,
//!     ) -> Result<Option<Value>, HandlerError> {
//!         Ok(jsonld)
//!     }
//! }
//!
//! # async fn start() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(PluginConfig::from_env()?);
//! let controller = Arc::new(HttpController::new(&config)?);
//! let store = Arc::new(S3BlobStore::new(&config)?);
//! let handlers = Handlers::new().with_task_handler(Passthrough);
//!
//! let mut runtime = PluginRuntime::new(config, controller, store, handlers)?;
//! runtime.run().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod runtime;
pub mod storage;
pub mod testing;
pub mod transport;
pub mod writer;

pub use config::{ConfigError, PluginConfig, StageConfig};
pub use error::{ErrorKind, HandlerError, PluginError, PluginResult};
pub use protocol::*;
pub use runtime::{GroupHandler, Handlers, PluginRuntime, TaskContext, TaskHandler};
pub use writer::{GroupWriter, OutputAggregator, WriterError};
