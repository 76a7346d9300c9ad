//! Error types for task orchestration.
//!
//! [`TaskError`] is returned by store and engine operations. It is distinct
//! from [`FailureDetail`](crate::types::FailureDetail), which is the
//! persisted reason a task ended up FAILED.

use std::fmt;

use crate::types::failure::{FailureDetail, FailureKind};

/// Errors that can occur during task operations.
///
/// Each variant carries the context needed to log it meaningfully. Use
/// [`failure_kind`](TaskError::failure_kind) when an error has to be
/// recorded on a task as a failure.
///
/// # Examples
///
/// ```
/// use armada_tasks::{FailureKind, TaskError};
///
/// let err = TaskError::Validation {
///     workflow: "container-host-provisioning".to_string(),
///     message: "resourceCount must be at least 1".to_string(),
/// };
/// assert_eq!(err.failure_kind(), FailureKind::Validation);
/// assert!(err.to_string().contains("resourceCount"));
/// ```
#[derive(Debug)]
pub enum TaskError {
    /// A creation request is missing required fields or holds bad values.
    Validation {
        /// Workflow kind the request was for.
        workflow: String,
        /// What was wrong.
        message: String,
    },

    /// An update targeted a stage or sub-stage not reachable from the
    /// current one. The record is left untouched.
    InvalidTransition {
        /// The task the update was addressed to.
        address: String,
        /// Current `STAGE(SUB_STAGE)`.
        from: String,
        /// Requested `STAGE(SUB_STAGE)`.
        to: String,
        /// Optional hint for the sender.
        suggested_action: Option<String>,
    },

    /// No task is stored at the address.
    NotFound {
        /// The address that was looked up.
        address: String,
    },

    /// A task with the requested address already exists.
    AlreadyExists {
        /// The conflicting address.
        address: String,
    },

    /// A compare-and-swap write lost against a concurrent writer.
    ConcurrentModification {
        /// The contended task.
        address: String,
        /// Version the writer read.
        expected_version: u64,
        /// Version found at write time.
        actual_version: u64,
    },

    /// The storage backend refused a write because it is full.
    StorageFull {
        /// Backend description of the limit.
        message: String,
    },

    /// No workflow is registered under the kind in the address.
    UnknownWorkflow {
        /// The unregistered workflow kind.
        workflow: String,
    },

    /// Waiting for a task to reach a terminal stage timed out.
    Timeout {
        /// The task being awaited.
        address: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Serialization or backend failure.
    StoreError(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { workflow, message } => {
                write!(f, "invalid {workflow} request: {message}")
            }
            Self::InvalidTransition {
                address, from, to, ..
            } => write!(f, "invalid transition from {from} to {to} for task {address}"),
            Self::NotFound { address } => write!(f, "task not found: {address}"),
            Self::AlreadyExists { address } => write!(f, "task already exists: {address}"),
            Self::ConcurrentModification {
                address,
                expected_version,
                actual_version,
            } => write!(
                f,
                "concurrent modification of task {address}: expected version {expected_version}, found {actual_version}"
            ),
            Self::StorageFull { message } => write!(f, "storage full: {message}"),
            Self::UnknownWorkflow { workflow } => write!(f, "unknown workflow: {workflow}"),
            Self::Timeout { address, waited_ms } => {
                write!(f, "task {address} not terminal after {waited_ms}ms")
            }
            Self::StoreError(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl std::error::Error for TaskError {}

impl TaskError {
    /// Failure category used when this error fails a task.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Validation { .. } => FailureKind::Validation,
            Self::Timeout { .. } => FailureKind::Expired,
            _ => FailureKind::Internal,
        }
    }

    /// Converts the error into a failure payload.
    pub fn to_failure(&self) -> FailureDetail {
        FailureDetail::new(self.failure_kind(), self.to_string())
    }
}
