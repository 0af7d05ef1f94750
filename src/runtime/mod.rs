//! Plugin runtime
//!
//! Pulls tasks from the controller one at a time, runs the registered
//! handler and reports the outcome.

pub mod cycle;
pub mod handler;
pub mod reporter;

pub use cycle::{AcquiredTask, CycleOutcome, DispatchedTask, PluginRuntime};
pub use handler::{GroupHandler, Handlers, TaskContext, TaskHandler};
pub use reporter::ResultReporter;
