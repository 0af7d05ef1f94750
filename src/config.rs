//! Plugin configuration
//!
//! Configuration is loaded once at startup, either from a TOML file or from the
//! process environment, and is never mutated afterwards. Workflow stages can
//! carry their own `env` overrides; those are layered on top of the base
//! configuration through [`StageConfig`] instead of touching the environment.

use crate::protocol::Workflow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main plugin configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
    /// Verbose error dumps
    #[serde(default)]
    pub debug: bool,
    pub controller: ControllerSection,
    pub object_store: ObjectStoreSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub index: IndexSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// Controller identity and location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerSection {
    /// Controller base URI, trailing slashes are stripped on load
    pub base_uri: String,
    /// Name of the pod running this plugin instance
    pub pod_name: String,
    /// Plugin identifier, matches the workflow stage name
    pub plugin_id: String,
}

/// S3-compatible object store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectStoreSection {
    /// `http` or `https`
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Local working directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSection {
    /// Directory group caches are downloaded and extracted into
    #[serde(default = "default_caches_path")]
    pub caches_path: PathBuf,
    /// Directory holding the per-task staging files of the group writer
    #[serde(default = "default_staging_path")]
    pub staging_path: PathBuf,
}

fn default_caches_path() -> PathBuf {
    PathBuf::from("/caches")
}

fn default_staging_path() -> PathBuf {
    std::env::temp_dir()
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            caches_path: default_caches_path(),
            staging_path: default_staging_path(),
        }
    }
}

/// Search index names used in bulk-update records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexSection {
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default = "default_doc_type")]
    pub doc_type: String,
    #[serde(default = "default_group_index")]
    pub group_index: String,
    #[serde(default = "default_group_type_group")]
    pub group_type_group: String,
    #[serde(default = "default_group_type_task")]
    pub group_type_task: String,
}

fn default_index() -> String {
    "pipeline".to_string()
}

fn default_doc_type() -> String {
    "task".to_string()
}

fn default_group_index() -> String {
    "group".to_string()
}

fn default_group_type_group() -> String {
    "groupResults".to_string()
}

fn default_group_type_task() -> String {
    "taskResults".to_string()
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            index: default_index(),
            doc_type: default_doc_type(),
            group_index: default_group_index(),
            group_type_group: default_group_type_group(),
            group_type_task: default_group_type_task(),
        }
    }
}

/// Retry and idle timing for controller calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Multiplier applied to the delay after each "unavailable" failure
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    /// Upper bound for the exponential delay
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Fixed delay after any other failure
    #[serde(default = "default_steady_retry_delay_ms")]
    pub steady_retry_delay_ms: u64,
    /// Delay before polling again when no task is ready
    #[serde(default = "default_idle_delay_on_empty_ms")]
    pub idle_delay_on_empty_ms: u64,
}

fn default_backoff_base() -> f64 {
    1.5
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_steady_retry_delay_ms() -> u64 {
    2_000
}

fn default_idle_delay_on_empty_ms() -> u64 {
    1_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            backoff_base: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap_ms(),
            steady_retry_delay_ms: default_steady_retry_delay_ms(),
            idle_delay_on_empty_ms: default_idle_delay_on_empty_ms(),
        }
    }
}

impl RetrySection {
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn steady_retry_delay(&self) -> Duration {
        Duration::from_millis(self.steady_retry_delay_ms)
    }

    pub fn idle_delay_on_empty(&self) -> Duration {
        Duration::from_millis(self.idle_delay_on_empty_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable {0} is not set")]
    EnvVarNotFound(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PluginConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PluginConfig = toml::from_str(&content)?;
        config.normalized()
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let required =
            |name: &str| get(name).ok_or_else(|| ConfigError::EnvVarNotFound(name.to_string()));

        let controller = ControllerSection {
            base_uri: required("CONTROLLER_BASE_URI")?,
            pod_name: required("POD_NAME")?,
            plugin_id: required("PLUGIN_ID")?,
        };

        let port = required("MINIO_PORT")?;
        let object_store = ObjectStoreSection {
            scheme: required("MINIO_SCHEME")?,
            host: required("MINIO_HOST")?,
            port: port.parse().map_err(|_| {
                ConfigError::InvalidConfig(format!("MINIO_PORT '{port}' is not a valid port"))
            })?,
            access_key: required("MINIO_ACCESS")?,
            secret_key: required("MINIO_SECRET")?,
            bucket: required("MINIO_BUCKET")?,
            region: get("MINIO_REGION").unwrap_or_else(default_region),
        };

        let cache = CacheSection {
            caches_path: get("CACHES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_caches_path),
            staging_path: get("STAGING_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_staging_path),
        };

        let index = IndexSection::default().overlay(|name| get(name));

        let config = PluginConfig {
            controller,
            object_store,
            cache,
            index,
            retry: RetrySection::default(),
            debug: get("DEBUG").is_some(),
        };

        config.normalized()
    }

    fn normalized(mut self) -> Result<Self, ConfigError> {
        self.controller.base_uri = self.controller.base_uri.trim_end_matches('/').to_string();
        self.validate()?;
        Ok(self)
    }

    /// Validate identities, URLs and retry timing
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("plugin_id", &self.controller.plugin_id)?;
        validate_identifier("pod_name", &self.controller.pod_name)?;

        let base = url::Url::parse(&self.controller.base_uri).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "controller base URI '{}' is invalid: {e}",
                self.controller.base_uri
            ))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "controller base URI must be http(s), got '{}'",
                base.scheme()
            )));
        }

        if !matches!(self.object_store.scheme.as_str(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "object store scheme must be http or https, got '{}'",
                self.object_store.scheme
            )));
        }
        if self.object_store.bucket.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "object store bucket must not be empty".to_string(),
            ));
        }

        if !self.retry.backoff_base.is_finite() || self.retry.backoff_base < 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "backoff_base must be >= 1.0, got {}",
                self.retry.backoff_base
            )));
        }

        Ok(())
    }

    /// `<pluginId>:<podName>`, sent as User-Agent on every controller request
    pub fn user_agent(&self) -> String {
        format!(
            "{}:{}",
            self.controller.plugin_id, self.controller.pod_name
        )
    }

    /// Object store endpoint URL
    pub fn object_store_endpoint(&self) -> String {
        format!(
            "{}://{}:{}",
            self.object_store.scheme, self.object_store.host, self.object_store.port
        )
    }

    /// Copy with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.object_store.access_key = "***".to_string();
        config.object_store.secret_key = "***".to_string();
        config
    }

    /// Resolve the configuration for the stage of `workflow` run by this plugin
    pub fn for_stage(self: &Arc<Self>, workflow: &Workflow) -> StageConfig {
        let overrides = workflow
            .stage_index(&self.controller.plugin_id)
            .and_then(|index| workflow.steps.get(index))
            .map(|stage| stage.env.clone())
            .unwrap_or_default();

        StageConfig {
            base: Arc::clone(self),
            overrides,
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[controller]
base_uri = "http://controller.local:8080"
pod_name = "test-pod"
plugin_id = "test-plugin"

[object_store]
host = "localhost"
port = 9000
access_key = "minio"
secret_key = "minio123"
bucket = "pipeline"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl IndexSection {
    /// Replace each name whose `ES_*` variable is provided by `lookup`
    fn overlay<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let fields: [(&str, &mut String); 5] = [
            ("ES_INDEX", &mut self.index),
            ("ES_TYPE", &mut self.doc_type),
            ("ES_GROUP_INDEX", &mut self.group_index),
            ("ES_GROUP_TYPE_GROUP", &mut self.group_type_group),
            ("ES_GROUP_TYPE_TASK", &mut self.group_type_task),
        ];
        for (name, field) in fields {
            if let Some(value) = lookup(name) {
                *field = value;
            }
        }
        self
    }
}

/// Immutable per-task view of the configuration
///
/// Holds the base configuration plus the `env` overrides of the workflow stage
/// being executed.
#[derive(Debug, Clone)]
pub struct StageConfig {
    base: Arc<PluginConfig>,
    overrides: HashMap<String, String>,
}

impl StageConfig {
    /// Stage config with no overrides
    pub fn base_only(base: Arc<PluginConfig>) -> Self {
        Self {
            base,
            overrides: HashMap::new(),
        }
    }

    pub fn base(&self) -> &PluginConfig {
        &self.base
    }

    pub fn overrides(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    /// Look up a variable set by the stage's `env` overrides
    pub fn var(&self, name: &str) -> Option<String> {
        self.overrides.get(name).cloned()
    }

    /// Index names with stage overrides applied
    pub fn index(&self) -> IndexSection {
        self.base
            .index
            .clone()
            .overlay(|name| self.overrides.get(name).cloned())
    }
}

/// Validate plugin and pod identifiers: `[a-zA-Z0-9._-]+`
fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if value.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidIdentifier(format!(
            "{field} '{value}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
