//! Control-plane configuration.
//!
//! Loaded from a TOML file, from `ARMADA_*` environment variables, or
//! both (file first, environment on top).

use std::path::{Path, PathBuf};
use std::time::Duration;

use armada_tasks::config::EngineConfig;
use armada_tasks::retry::RetryPolicy;
use armada_tasks::store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::constants::{HOST_CONNECTION_RETRY_ATTEMPTS, HOST_CONNECTION_RETRY_DELAY_MS};
use crate::error::ConfigError;
use crate::registry::ResourceType;

/// Top-level configuration.
///
/// # Example Configuration File
///
/// ```toml
/// log_filter = "armada=debug,armada_tasks=info"
///
/// [engine]
/// default_task_ttl_ms = 86400000
///
/// [engine.retry]
/// max_attempts = 5
/// delay_ms = 2000
///
/// [store]
/// backend = "file"
/// path = "/var/lib/armada/tasks"
///
/// [workflows]
/// removal_order = ["CONTAINER", "COMPUTE", "NETWORK", "VOLUME"]
///
/// [workflows.host_connection_retry]
/// max_attempts = 10
/// delay_ms = 10000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub workflows: WorkflowSettings,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            engine: EngineConfig::default(),
            store: StoreSettings::default(),
            workflows: WorkflowSettings::default(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file can not be read and
    /// [`ConfigError::Parse`] if it is not valid configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(Into::into)
    }

    /// Serialize the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if a value has no TOML form.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(Into::into)
    }

    /// Load configuration from environment variables on top of the
    /// defaults.
    ///
    /// | Variable                     | Setting                         |
    /// |------------------------------|---------------------------------|
    /// | `ARMADA_LOG`                 | `log_filter`                    |
    /// | `ARMADA_STORE_BACKEND`       | `store.backend`                 |
    /// | `ARMADA_STORE_PATH`          | `store.path`                    |
    /// | `ARMADA_STORE_URL`           | `store.url`                     |
    /// | `ARMADA_STORE_PREFIX`        | `store.prefix`                  |
    /// | `ARMADA_TASK_TTL_MS`         | `engine.default_task_ttl_ms`    |
    /// | `ARMADA_RETRY_MAX_ATTEMPTS`  | `engine.retry.max_attempts`     |
    /// | `ARMADA_RETRY_DELAY_MS`      | `engine.retry.delay_ms`         |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Overrides settings from `ARMADA_*` pairs; other keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a value that does not parse.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(setting) = key.strip_prefix("ARMADA_") else {
                continue;
            };
            match setting {
                "LOG" => self.log_filter = value,
                "STORE_BACKEND" => self.store.backend = parse_backend(&key, &value)?,
                "STORE_PATH" => self.store.path = Some(PathBuf::from(value)),
                "STORE_URL" => self.store.url = Some(value),
                "STORE_PREFIX" => self.store.prefix = Some(value),
                "TASK_TTL_MS" => self.engine.default_task_ttl_ms = Some(parse_number(&key, &value)?),
                "RETRY_MAX_ATTEMPTS" => {
                    self.engine.retry.max_attempts = parse_number(&key, &value)?;
                }
                "RETRY_DELAY_MS" => self.engine.retry.delay_ms = parse_number(&key, &value)?,
                _ => tracing::debug!(key = %key, "ignoring unknown ARMADA_ variable"),
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_backend(key: &str, value: &str) -> Result<BackendKind, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(BackendKind::Memory),
        "file" => Ok(BackendKind::File),
        "redis" => Ok(BackendKind::Redis),
        other => Err(ConfigError::Invalid {
            key: key.to_string(),
            message: format!("unknown backend '{other}', expected memory, file or redis"),
        }),
    }
}

/// Which storage backend holds task records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Redis,
}

/// The `[store]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: BackendKind,

    /// Directory of the file backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Connection URL of the Redis backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Key prefix of the Redis backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,

    #[serde(default = "default_max_record_size")]
    pub max_record_size_bytes: usize,
}

fn default_max_cas_retries() -> u32 {
    StoreConfig::default().max_cas_retries
}

fn default_max_record_size() -> usize {
    StoreConfig::default().max_record_size_bytes
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: None,
            url: None,
            prefix: None,
            max_cas_retries: default_max_cas_retries(),
            max_record_size_bytes: default_max_record_size(),
        }
    }
}

impl StoreSettings {
    /// Limits for the task store.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_cas_retries: self.max_cas_retries,
            max_record_size_bytes: self.max_record_size_bytes,
            ..StoreConfig::default()
        }
    }
}

/// The `[workflows]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Budget for validating the connection of a newly provisioned host.
    #[serde(default = "default_host_connection_retry")]
    pub host_connection_retry: RetryPolicy,

    /// Order in which composite removal deletes component resources,
    /// one type at a time. Types not listed fail the removal.
    #[serde(default = "default_removal_order")]
    pub removal_order: Vec<ResourceType>,
}

fn default_host_connection_retry() -> RetryPolicy {
    RetryPolicy::new(
        HOST_CONNECTION_RETRY_ATTEMPTS,
        Duration::from_millis(HOST_CONNECTION_RETRY_DELAY_MS),
    )
}

fn default_removal_order() -> Vec<ResourceType> {
    vec![
        ResourceType::Container,
        ResourceType::Compute,
        ResourceType::Network,
        ResourceType::Volume,
    ]
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            host_connection_retry: default_host_connection_retry(),
            removal_order: default_removal_order(),
        }
    }
}

impl WorkflowSettings {
    pub fn with_host_connection_retry(mut self, policy: RetryPolicy) -> Self {
        self.host_connection_retry = policy;
        self
    }
}
