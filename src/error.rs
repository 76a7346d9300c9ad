//! Error types for adapters, the resource registry and configuration.

use armada_tasks::retry::RetryableError;
use armada_tasks::store::StorageError;
use armada_tasks::{FailureDetail, FailureKind, TaskError};
use thiserror::Error;

/// Errors returned by an [`Adapter`](crate::adapter::Adapter).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The remote endpoint could not be reached or answered with a
    /// server-side error.
    #[error("{adapter} unavailable for '{reference}': {message}")]
    Unavailable {
        /// Adapter name
        adapter: String,
        /// Resource the request was about
        reference: String,
        /// Remote error text
        message: String,
    },

    /// The remote endpoint rejected the request.
    #[error("{adapter} rejected '{reference}' with status {status}: {message}")]
    Rejected {
        /// Adapter name
        adapter: String,
        /// Resource the request was about
        reference: String,
        /// Remote status code
        status: u16,
        /// Remote error text
        message: String,
    },

    /// The remote call did not answer in time.
    #[error("{adapter} timed out on '{reference}'")]
    Timeout {
        /// Adapter name
        adapter: String,
        /// Resource the request was about
        reference: String,
    },

    /// A request that must report back through a callback carried none.
    #[error("request for '{reference}' has no callback")]
    MissingCallback {
        /// Resource the request was about
        reference: String,
    },
}

impl AdapterError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } => true,
            Self::Rejected { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::MissingCallback { .. } => false,
        }
    }

    /// Failure detail recorded on a task this error fails.
    pub fn to_failure(&self) -> FailureDetail {
        let kind = match self {
            Self::MissingCallback { .. } => FailureKind::Internal,
            _ => FailureKind::Remote,
        };
        let failure = FailureDetail::new(kind, self.to_string());
        match self {
            Self::Rejected { status, .. } => failure.with_status_code(*status),
            Self::Unavailable { .. } => failure.with_status_code(503),
            Self::Timeout { .. } => failure.with_status_code(504),
            Self::MissingCallback { .. } => failure,
        }
    }
}

impl RetryableError for AdapterError {
    fn is_retryable(&self) -> bool {
        AdapterError::is_retryable(self)
    }

    fn status_code(&self) -> Option<u16> {
        self.to_failure().status_code
    }
}

impl From<AdapterError> for FailureDetail {
    fn from(err: AdapterError) -> Self {
        err.to_failure()
    }
}

/// Errors from the resource registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No resource is registered under the link.
    #[error("resource not found: {link}")]
    NotFound {
        /// The link that was looked up
        link: String,
    },

    /// A resource with the link already exists.
    #[error("resource already exists: {link}")]
    AlreadyExists {
        /// The conflicting link
        link: String,
    },

    /// The link does not name a known resource type.
    #[error("invalid resource link '{link}': {reason}")]
    InvalidLink {
        /// The rejected link
        link: String,
        /// Why it was rejected
        reason: String,
    },
}

impl From<RegistryError> for FailureDetail {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { .. } => {
                FailureDetail::validation(err.to_string()).with_status_code(404)
            }
            RegistryError::AlreadyExists { .. } => {
                FailureDetail::internal(err.to_string()).with_status_code(409)
            }
            RegistryError::InvalidLink { .. } => FailureDetail::validation(err.to_string()),
        }
    }
}

impl From<RegistryError> for TaskError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { link } => TaskError::NotFound { address: link },
            RegistryError::AlreadyExists { link } => TaskError::AlreadyExists { address: link },
            RegistryError::InvalidLink { .. } => TaskError::StoreError(err.to_string()),
        }
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML document does not parse.
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be written as TOML.
    #[error("TOML serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is present but unusable.
    #[error("invalid value for {key}: {message}")]
    Invalid {
        /// Setting name
        key: String,
        /// What was wrong
        message: String,
    },

    /// A global subscriber is already installed.
    #[error("logging already initialized: {0}")]
    Logging(String),
}

/// Errors from building or driving a [`ControlPlane`](crate::control_plane::ControlPlane).
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage backend error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Task(#[from] TaskError),
}
