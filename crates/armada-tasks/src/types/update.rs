//! The update message: the only way a task record changes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::failure::FailureDetail;
use crate::types::link::TaskAddress;
use crate::types::stage::TaskStage;
use crate::types::sub_stage::{StageTarget, SubStage};

/// A partial state change addressed to one task.
///
/// Any component may send one: the task itself, a child task resolving its
/// link, or a fan-out completion. The transition engine is the only
/// consumer.
///
/// `body` is a workflow-specific JSON patch deserialized into the target
/// workflow's body type and merged field by field. `source` identifies the
/// sender (for example a child address) and lets accumulating sub-stages
/// drop redelivered completions.
///
/// # Examples
///
/// ```
/// use armada_tasks::{DefaultSubStage, TaskAddress, TaskStage, TaskUpdate};
///
/// let update = TaskUpdate::to_sub_stage(TaskAddress::new("counter", "1"), DefaultSubStage::Processing)
///     .with_resource_links(["/resources/compute/a"])
///     .with_custom_property("__contextId", "ctx-1");
/// assert_eq!(update.stage, TaskStage::Started);
/// assert_eq!(update.sub_stage.as_deref(), Some("PROCESSING"));
/// assert_eq!(update.resource_links.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub target: TaskAddress,
    pub stage: TaskStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resource_links: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TaskUpdate {
    /// Bare update moving `target` to `stage` without naming a sub-stage.
    pub fn new(target: TaskAddress, stage: TaskStage) -> Self {
        Self {
            target,
            stage,
            sub_stage: None,
            resource_links: BTreeSet::new(),
            custom_properties: BTreeMap::new(),
            failure: None,
            body: None,
            source: None,
        }
    }

    /// Moves `target` to `sub_stage` inside `STARTED`.
    pub fn to_sub_stage<S: SubStage>(target: TaskAddress, sub_stage: S) -> Self {
        Self::new(target, TaskStage::Started).with_sub_stage_name(sub_stage.name())
    }

    /// Moves `target` to a named `(stage, sub-stage)` pair.
    pub fn to_target(target: TaskAddress, stage_target: &StageTarget) -> Self {
        Self::new(target, stage_target.stage).with_sub_stage_name(&stage_target.sub_stage)
    }

    /// Fails `target`: moves it to `ERROR` carrying `failure`.
    pub fn failed(target: TaskAddress, failure: FailureDetail) -> Self {
        let mut update = Self::new(target, TaskStage::Started).with_sub_stage_name("ERROR");
        update.failure = Some(failure);
        update
    }

    pub fn with_sub_stage_name(mut self, name: &str) -> Self {
        self.sub_stage = Some(name.to_string());
        self
    }

    pub fn with_resource_links<I, L>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.resource_links.extend(links.into_iter().map(Into::into));
        self
    }

    pub fn with_custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_custom_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.custom_properties.extend(properties);
        self
    }

    pub fn with_failure(mut self, failure: FailureDetail) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Attaches a body patch. Object patches are merged key-wise with any
    /// patch already attached.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = match (self.body.take(), body) {
            (Some(Value::Object(mut existing)), Value::Object(extra)) => {
                existing.extend(extra);
                Some(Value::Object(existing))
            }
            (_, body) => Some(body),
        };
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_targets_error_sub_stage() {
        let update = TaskUpdate::failed(
            TaskAddress::new("a", "1"),
            FailureDetail::remote("nope"),
        );
        assert_eq!(update.stage, TaskStage::Started);
        assert_eq!(update.sub_stage.as_deref(), Some("ERROR"));
        assert!(update.failure.is_some());
    }

    #[test]
    fn body_patches_accumulate() {
        let update = TaskUpdate::new(TaskAddress::new("a", "1"), TaskStage::Started)
            .with_body(json!({"a": 1}))
            .with_body(json!({"b": 2}));
        assert_eq!(update.body, Some(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn empty_collections_are_not_serialized() {
        let update = TaskUpdate::new(TaskAddress::new("a", "1"), TaskStage::Finished);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, json!({"target": "a:1", "stage": "FINISHED"}));
        let back: TaskUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(back, update);
    }
}
