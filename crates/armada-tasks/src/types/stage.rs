//! Coarse task lifecycle stages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Lifecycle stage shared by every workflow.
///
/// Stages are ordered by declaration: a task never moves to a stage that
/// sorts before its current one. `Cancelled`, `Finished` and `Failed` are
/// terminal and absorb every later update.
///
/// # State Machine
///
/// ```text
/// Created -> Started, Cancelled, Finished, Failed
/// Started -> Cancelled, Finished, Failed
/// Cancelled, Finished, Failed -> (terminal)
/// ```
///
/// # Examples
///
/// ```
/// use armada_tasks::TaskStage;
///
/// assert!(TaskStage::Created < TaskStage::Started);
/// assert!(TaskStage::Failed.is_terminal());
/// assert!(TaskStage::Started.can_transition_to(&TaskStage::Finished));
/// assert!(!TaskStage::Finished.can_transition_to(&TaskStage::Started));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    /// Persisted but not yet started.
    Created,
    /// Advancing through workflow sub-stages.
    Started,
    /// Explicitly cancelled (terminal).
    Cancelled,
    /// Completed successfully (terminal).
    Finished,
    /// Failed with a failure detail (terminal).
    Failed,
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Started => write!(f, "STARTED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Finished => write!(f, "FINISHED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl TaskStage {
    /// Returns `true` for `Cancelled`, `Finished` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished | Self::Failed)
    }

    /// Returns `true` if a task in this stage may move to `next`.
    ///
    /// Staying in `Created` or `Started` is allowed (sub-stage progress
    /// happens inside a stage). Terminal stages accept nothing.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next >= self
    }

    /// Validates a stage move for the task at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTransition`] when the move would go
    /// backwards or leave a terminal stage.
    ///
    /// # Examples
    ///
    /// ```
    /// use armada_tasks::TaskStage;
    ///
    /// assert!(TaskStage::Started
    ///     .validate_transition("hosts:1", &TaskStage::Failed)
    ///     .is_ok());
    /// assert!(TaskStage::Started
    ///     .validate_transition("hosts:1", &TaskStage::Created)
    ///     .is_err());
    /// ```
    pub fn validate_transition(&self, address: &str, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        let suggested_action = if self.is_terminal() {
            Some("task is in a terminal stage and accepts no further updates".to_string())
        } else {
            Some(format!("stage can not move backwards from {self}"))
        };
        Err(TaskError::InvalidTransition {
            address: address.to_string(),
            from: self.to_string(),
            to: next.to_string(),
            suggested_action,
        })
    }
}
