//! Task addresses and parent/child task links.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::stage::TaskStage;
use crate::types::sub_stage::{StageTarget, SubStage};

/// Stable address of one task: `{workflow}:{id}`.
///
/// The address is both the store key and the target of update messages.
/// Workflow kinds never contain a colon, so the first colon separates the
/// two parts.
///
/// # Examples
///
/// ```
/// use armada_tasks::TaskAddress;
///
/// let address = TaskAddress::new("composite-removal", "7");
/// assert_eq!(address.as_str(), "composite-removal:7");
/// assert_eq!(address.workflow(), "composite-removal");
/// assert_eq!(address.id(), "7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskAddress(String);

impl TaskAddress {
    pub fn new(workflow: &str, id: &str) -> Self {
        Self(format!("{workflow}:{id}"))
    }

    /// Generates a fresh address with a `UUIDv4` id.
    pub fn generate(workflow: &str) -> Self {
        Self::new(workflow, &Uuid::new_v4().to_string())
    }

    /// Parses `{workflow}:{id}`, returning `None` without a separator.
    pub fn parse(raw: &str) -> Option<Self> {
        let (workflow, id) = raw.split_once(':')?;
        if workflow.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn workflow(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(w, _)| w)
    }

    pub fn id(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, id)| id)
    }
}

impl fmt::Display for TaskAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parent callback carried by a child task.
///
/// A parent that needs a helper workflow builds a link pointing at itself
/// with the sub-stage it wants to resume at, and hands it to the child on
/// creation. When the child reaches a terminal stage it sends exactly one
/// update to `parent`, using `on_finish` or `on_fail`.
///
/// # Examples
///
/// ```
/// use armada_tasks::{DefaultSubStage, TaskAddress, TaskLink, TaskStage};
///
/// let parent = TaskAddress::new("container-host-provisioning", "1");
/// let link = TaskLink::new(parent.clone(), DefaultSubStage::Processing);
/// assert_eq!(link.on_finish.stage, TaskStage::Started);
/// assert_eq!(link.on_finish.sub_stage, "PROCESSING");
/// assert_eq!(link.on_fail.sub_stage, "ERROR");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLink {
    pub parent: TaskAddress,
    pub on_finish: StageTarget,
    pub on_fail: StageTarget,
}

impl TaskLink {
    /// Resumes the parent at `on_finish`, or at its `ERROR` sub-stage when
    /// the child fails.
    pub fn new<S: SubStage>(parent: TaskAddress, on_finish: S) -> Self {
        Self::with_fail(parent, on_finish, S::ERROR)
    }

    /// Resumes the parent at `on_fail` instead of `ERROR` on failure.
    pub fn with_fail<S: SubStage>(parent: TaskAddress, on_finish: S, on_fail: S) -> Self {
        Self {
            parent,
            on_finish: StageTarget::started(on_finish),
            on_fail: StageTarget::started(on_fail),
        }
    }

    /// Link whose targets are arbitrary `(stage, sub-stage)` pairs.
    pub fn with_targets(parent: TaskAddress, on_finish: StageTarget, on_fail: StageTarget) -> Self {
        Self {
            parent,
            on_finish,
            on_fail,
        }
    }

    /// Target for a child that ended in `stage`.
    pub fn target_for(&self, stage: TaskStage) -> &StageTarget {
        if stage == TaskStage::Finished {
            &self.on_finish
        } else {
            &self.on_fail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sub_stage::DefaultSubStage;

    #[test]
    fn parse_rejects_missing_parts() {
        assert!(TaskAddress::parse("no-separator").is_none());
        assert!(TaskAddress::parse(":id").is_none());
        assert!(TaskAddress::parse("kind:").is_none());
        assert_eq!(
            TaskAddress::parse("kind:a:b").map(|a| a.id().to_string()),
            Some("a:b".to_string())
        );
    }

    #[test]
    fn generated_addresses_are_unique() {
        let a = TaskAddress::generate("counter");
        let b = TaskAddress::generate("counter");
        assert_ne!(a, b);
        assert_eq!(a.workflow(), "counter");
    }

    #[test]
    fn failed_and_cancelled_children_use_the_fail_target() {
        let link = TaskLink::new(TaskAddress::new("p", "1"), DefaultSubStage::Processing);
        assert_eq!(link.target_for(TaskStage::Finished).sub_stage, "PROCESSING");
        assert_eq!(link.target_for(TaskStage::Failed).sub_stage, "ERROR");
        assert_eq!(link.target_for(TaskStage::Cancelled).sub_stage, "ERROR");
    }

    #[test]
    fn address_serializes_as_plain_string() {
        let json = serde_json::to_string(&TaskAddress::new("a", "b")).unwrap();
        assert_eq!(json, "\"a:b\"");
    }
}
