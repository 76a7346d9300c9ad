//! Failure payload carried by FAILED tasks and forwarded to parents.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Creation request or state failed validation.
    Validation,
    /// A remote call failed with a non-retryable error.
    Remote,
    /// A remote call kept failing until its retry budget ran out.
    RetryExhausted,
    /// The task was cancelled.
    Cancelled,
    /// The task outlived its expiry time.
    Expired,
    /// Engine or store failure.
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Remote => write!(f, "remote"),
            Self::RetryExhausted => write!(f, "retry_exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Why a task failed.
///
/// The detail is attached to the FAILED record and forwarded verbatim
/// along the parent callback chain, so a top-level request sees the
/// message produced where the failure happened.
///
/// # Examples
///
/// ```
/// use armada_tasks::{FailureDetail, FailureKind};
///
/// let failure = FailureDetail::remote("docker daemon unreachable")
///     .with_status_code(503)
///     .with_source("compute-provision:42");
/// assert_eq!(failure.kind, FailureKind::Remote);
/// assert_eq!(failure.to_string(), "remote: docker daemon unreachable (status 503)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    pub message: String,
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Address of the task where the failure originated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_address: Option<String>,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            status_code: None,
            source_address: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Remote, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Sets the originating address unless one is already recorded.
    pub fn with_source(mut self, address: impl Into<String>) -> Self {
        if self.source_address.is_none() {
            self.source_address = Some(address.into());
        }
        self
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.status_code {
            write!(f, " (status {code})")?;
        }
        Ok(())
    }
}
