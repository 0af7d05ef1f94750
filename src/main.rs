//! Pipeline plugin - Main Entry Point
//!
//! Runs an echo plugin against the configured controller: single-file tasks
//! are returned unchanged and group tasks report no additional metadata.
//! Useful for smoke-testing a pipeline before real handlers are deployed.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use pipeline_plugin::error::HandlerError;
use pipeline_plugin::observability::init_default_logging;
use pipeline_plugin::runtime::{GroupHandler, Handlers, PluginRuntime, TaskContext, TaskHandler};
use pipeline_plugin::storage::S3BlobStore;
use pipeline_plugin::transport::HttpController;
use pipeline_plugin::PluginConfig;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info};

/// Pipeline plugin runtime
#[derive(Parser)]
#[command(name = "pipeline-plugin")]
#[command(about = "Plugin runtime for a controller-driven document pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path; the environment is used when omitted
    #[arg(short, long, value_name = "FILE", env = "PLUGIN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the echo plugin until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show the resolved configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting pipeline plugin v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_plugin(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(path: Option<&Path>) -> Result<PluginConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(PluginConfig::load_from_file(path)?)
        }
        None => {
            info!("Loading configuration from environment");
            Ok(PluginConfig::from_env()?)
        }
    }
}

/// Returns the input document unchanged
struct EchoTaskHandler;

#[async_trait]
impl TaskHandler for EchoTaskHandler {
    async fn handle(
        &self,
        ctx: &TaskContext,
        jsonld: Option<Value>,
        url: Option<String>,
    ) -> Result<Option<Value>, HandlerError> {
        debug!(task_id = ctx.task_id(), url = ?url, "Echoing document");
        Ok(jsonld)
    }
}

/// Acknowledges group tasks without adding metadata
struct EchoGroupHandler;

#[async_trait]
impl GroupHandler for EchoGroupHandler {
    async fn handle(
        &self,
        ctx: &TaskContext,
        cache_path: Option<&Path>,
    ) -> Result<Option<Map<String, Value>>, HandlerError> {
        debug!(task_id = ctx.task_id(), cache = ?cache_path, "Acknowledging group task");
        Ok(None)
    }
}

async fn run_plugin(config: PluginConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        plugin_id = %config.controller.plugin_id,
        pod_name = %config.controller.pod_name,
        "Application starting"
    );

    let config = Arc::new(config);
    let controller = Arc::new(HttpController::new(&config)?);
    let blob_store = Arc::new(S3BlobStore::new(&config)?);
    let handlers = Handlers::new()
        .with_task_handler(EchoTaskHandler)
        .with_group_handler(EchoGroupHandler);

    let mut runtime = PluginRuntime::new(config, controller, blob_store, handlers)?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    // the cycle never returns; an in-flight task is abandoned on shutdown
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = runtime.run() => {}
    }

    Ok(())
}

fn handle_config_command(
    config: &PluginConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!("Configuration validation complete");
    Ok(())
}
