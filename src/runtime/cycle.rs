//! The acquire → dispatch → report cycle
//!
//! One task is in flight at a time. [`PluginRuntime::acquire`] borrows the
//! runtime mutably for as long as the acquired task lives, and the task can
//! only move forward: [`AcquiredTask::dispatch`] consumes it into a
//! [`DispatchedTask`], whose [`report`](DispatchedTask::report) consumes it
//! and releases the runtime. A second task cannot be acquired or dispatched
//! before the first is reported.
//!
//! ```compile_fail
//! use pipeline_plugin::runtime::PluginRuntime;
//!
//! async fn two_at_once(runtime: &mut PluginRuntime) {
//!     let first = runtime.acquire().await;
//!     let second = runtime.acquire().await;
//!     drop((first, second));
//! }
//! ```

use crate::cache::CacheFetcher;
use crate::config::PluginConfig;
use crate::error::{PluginError, PluginResult};
use crate::protocol::{ResultPayload, ResultStatus, Task, WorkflowType};
use crate::runtime::handler::{Handlers, TaskContext};
use crate::runtime::reporter::ResultReporter;
use crate::storage::BlobStore;
use crate::transport::{Controller, RetryPolicy, RetryingTransport, TransportError};
use crate::{cycle_span, task_span};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn, Instrument, Span};

/// How a call to [`PluginRuntime::run_once`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No task was acquired; the idle delay has been waited out
    Idle,
    /// The task's payload was accepted by the controller
    Reported {
        task_id: String,
        status: ResultStatus,
    },
    /// Submission failed with a non-retryable error
    ReportFailed {
        task_id: String,
        error: TransportError,
    },
}

/// Drives the task cycle for one plugin instance
pub struct PluginRuntime {
    config: Arc<PluginConfig>,
    controller: Arc<dyn Controller>,
    blob_store: Arc<dyn BlobStore>,
    handlers: Handlers,
    cache: CacheFetcher,
    transport: RetryingTransport,
    reporter: ResultReporter,
    cycles: u64,
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("plugin_id", &self.config.controller.plugin_id)
            .field("pod_name", &self.config.controller.pod_name)
            .field("handlers", &self.handlers)
            .field("cycles", &self.cycles)
            .finish()
    }
}

impl PluginRuntime {
    /// Create a runtime; fails when no handler is registered
    pub fn new(
        config: Arc<PluginConfig>,
        controller: Arc<dyn Controller>,
        blob_store: Arc<dyn BlobStore>,
        handlers: Handlers,
    ) -> PluginResult<Self> {
        handlers.validate()?;

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .build()
            .map_err(|e| TransportError::fatal(format!("failed to build HTTP client: {e}")))?;
        let cache = CacheFetcher::new(client, config.cache.caches_path.clone());
        let transport = RetryingTransport::new(RetryPolicy::from_config(&config.retry));
        let reporter = ResultReporter::new(Arc::clone(&controller), transport);

        Ok(Self {
            config,
            controller,
            blob_store,
            handlers,
            cache,
            transport,
            reporter,
            cycles: 0,
        })
    }

    /// Replace the cache fetcher
    pub fn with_cache_fetcher(mut self, cache: CacheFetcher) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.transport.policy()
    }

    /// Number of acquisition attempts so far
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Fetch the next task, retrying transport failures
    ///
    /// Returns `None` when nothing is ready or the fetch failed fatally.
    pub async fn acquire(&mut self) -> Option<AcquiredTask<'_>> {
        self.cycles += 1;
        let controller = self.controller.as_ref();

        let fetched = self
            .transport
            .call("fetch_task", Duration::ZERO, move || controller.fetch_task())
            .instrument(cycle_span!(cycle = self.cycles))
            .await;

        match fetched {
            Ok(Some(task)) => {
                debug!(task_id = %task.task_id(), "Task acquired");
                Some(AcquiredTask {
                    runtime: self,
                    task,
                })
            }
            Ok(None) => {
                debug!("No task available");
                None
            }
            Err(e) => {
                error!(reason = "GET_TASK", error = %e, "Failed to fetch task");
                None
            }
        }
    }

    /// Run a single cycle
    ///
    /// When no task is acquired this waits the idle delay before returning.
    pub async fn run_once(&mut self) -> CycleOutcome {
        let idle = self.transport.policy().idle_delay_on_empty;
        match self.acquire().await {
            Some(task) => task.dispatch().await.report().await,
            None => {
                sleep(idle).await;
                CycleOutcome::Idle
            }
        }
    }

    /// Run cycles until the process is stopped
    pub async fn run(&mut self) {
        info!(
            plugin_id = %self.config.controller.plugin_id,
            pod_name = %self.config.controller.pod_name,
            controller = %self.config.controller.base_uri,
            "Plugin runtime started"
        );
        loop {
            self.run_once().await;
        }
    }

    fn instance(&self) -> &str {
        &self.config.controller.pod_name
    }

    async fn execute(&self, task: Task) -> ResultPayload {
        let workflow = &task.metadata.job.workflow;
        let plugin_id = &self.config.controller.plugin_id;
        let stage_index = workflow.stage_index(plugin_id);
        match stage_index {
            Some(index) => debug!(stage = index, "Running workflow stage"),
            None => warn!(plugin_id = %plugin_id, "Plugin not found in workflow, using base configuration"),
        }
        let stage = self.config.for_stage(workflow);
        let kind = task.workflow_type();

        let Task {
            metadata,
            jsonld,
            url,
        } = task;
        let ctx = TaskContext::new(
            metadata,
            stage,
            stage_index,
            Arc::clone(&self.controller),
            self.transport,
            Arc::clone(&self.blob_store),
        );

        match kind {
            WorkflowType::SingleFile => self.run_single_file(&ctx, jsonld, url).await,
            WorkflowType::Group => self.run_group(&ctx).await,
            WorkflowType::Unsupported => {
                let err = PluginError::invalid_task("unsupported workflow type");
                warn!(error = %err, "Rejecting task");
                ResultPayload::failure(self.instance(), err.report_message())
            }
        }
    }

    async fn run_single_file(
        &self,
        ctx: &TaskContext,
        jsonld: Option<serde_json::Value>,
        url: Option<String>,
    ) -> ResultPayload {
        let Some(handler) = self.handlers.task() else {
            let err = PluginError::MissingHandler(WorkflowType::SingleFile.to_string());
            warn!(error = %err, "Rejecting task");
            return ResultPayload::failure(self.instance(), err.report_message());
        };

        let outcome = handler.handle(ctx, jsonld, url).await.map_err(|e| {
            let err = PluginError::handler_failure(&e);
            error!(reason = "HANDLE_SINGLE_FILE", error = %err, "Task handler failed");
            err.report_message()
        });
        ResultPayload::single_file(self.instance(), outcome)
    }

    async fn run_group(&self, ctx: &TaskContext) -> ResultPayload {
        let Some(handler) = self.handlers.group() else {
            let err = PluginError::MissingHandler(WorkflowType::Group.to_string());
            warn!(error = %err, "Rejecting task");
            return ResultPayload::failure(self.instance(), err.report_message());
        };

        let cache_path: Option<PathBuf> = match ctx.metadata().cache_url() {
            Some(url) => match self.cache.fetch(url).await {
                Ok(path) => Some(path),
                Err(e) => {
                    let err = PluginError::from(e);
                    error!(reason = "DOWNLOADING_CACHE", url, error = %err, "Cache download failed");
                    self.remove_cache().await;
                    return ResultPayload::failure(self.instance(), err.report_message());
                }
            },
            None => None,
        };

        let outcome = handler.handle(ctx, cache_path.as_deref()).await;
        if cache_path.is_some() {
            self.remove_cache().await;
        }

        let outcome = outcome.map_err(|e| {
            let err = PluginError::handler_failure(&e);
            error!(reason = "GROUP_TASK", error = %err, "Group handler failed");
            err.report_message()
        });
        ResultPayload::group(self.instance(), outcome)
    }

    async fn remove_cache(&self) {
        if let Err(e) = self.cache.cleanup().await {
            warn!(reason = "REMOVING_CACHE", error = %e, "Failed to remove cache");
        }
    }
}

/// A task fetched from the controller, not yet processed
#[must_use = "an acquired task must be dispatched and reported"]
pub struct AcquiredTask<'a> {
    runtime: &'a mut PluginRuntime,
    task: Task,
}

impl<'a> AcquiredTask<'a> {
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Run the matching handler and build the result payload
    pub async fn dispatch(self) -> DispatchedTask<'a> {
        let AcquiredTask { runtime, task } = self;
        let task_id = task.task_id().to_string();
        let span = task_span!(
            task_id = %task_id,
            job_id = %task.job_id(),
            workflow = %task.workflow_type()
        );

        let payload = runtime.execute(task).instrument(span.clone()).await;

        DispatchedTask {
            runtime,
            task_id,
            payload,
            span,
        }
    }
}

/// A processed task whose payload has not been submitted yet
#[must_use = "a dispatched task must be reported"]
pub struct DispatchedTask<'a> {
    runtime: &'a mut PluginRuntime,
    task_id: String,
    payload: ResultPayload,
    span: Span,
}

impl DispatchedTask<'_> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn payload(&self) -> &ResultPayload {
        &self.payload
    }

    /// Submit the payload; this is the task's only terminal event
    pub async fn report(self) -> CycleOutcome {
        let DispatchedTask {
            runtime,
            task_id,
            payload,
            span,
        } = self;

        match runtime
            .reporter
            .submit(&task_id, &payload)
            .instrument(span)
            .await
        {
            Ok(()) => CycleOutcome::Reported {
                task_id,
                status: payload.status(),
            },
            Err(e) => {
                error!(reason = "SUBMIT_RESULTS", task_id = %task_id, error = %e, "Failed to submit result");
                CycleOutcome::ReportFailed { task_id, error: e }
            }
        }
    }
}
