//! The trait every workflow implements.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::record::{TaskBody, TaskRecord};
use crate::engine::context::StageContext;
use crate::error::TaskError;
use crate::types::sub_stage::SubStage;
use crate::types::update::TaskUpdate;

/// Typed record of workflow `W`.
pub type TaskOf<W> = TaskRecord<<W as Workflow>::SubStage, <W as Workflow>::Body>;

/// What to do with an update that targets the current `(stage, sub-stage)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Repeat {
    /// Drop it. Redelivered updates land here.
    #[default]
    Ignore,
    /// Merge the payload without invoking the handler again.
    Merge,
    /// Merge the payload and invoke the handler on the merged record.
    MergeAndDispatch,
}

/// Payload a terminal child hands its parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackPayload {
    pub resource_links: BTreeSet<String>,
    pub custom_properties: BTreeMap<String, String>,
    /// Patch for the parent's body, if the parent expects one.
    pub body: Option<Value>,
}

impl CallbackPayload {
    pub fn with_resource_links(links: BTreeSet<String>) -> Self {
        Self {
            resource_links: links,
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }
}

/// A long-lived, persisted workflow driven by update messages.
///
/// The engine calls [`handle`](Workflow::handle) once for every accepted
/// update that lands the task on a `STARTED` sub-stage other than
/// `COMPLETED` and `ERROR`. A handler performs side effects and reports
/// back by sending updates through its [`StageContext`]; it never writes
/// the record directly.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use armada_tasks::domain::NoBody;
/// use armada_tasks::engine::{StageContext, TaskOf, Workflow};
/// use armada_tasks::{DefaultSubStage, TaskError};
///
/// struct Ping;
///
/// #[async_trait]
/// impl Workflow for Ping {
///     type SubStage = DefaultSubStage;
///     type Body = NoBody;
///     const KIND: &'static str = "ping";
///
///     async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
///         match task.sub_stage {
///             DefaultSubStage::Created => ctx.proceed(DefaultSubStage::Processing),
///             DefaultSubStage::Processing => ctx.complete(),
///             DefaultSubStage::Completed | DefaultSubStage::Error => {}
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + Sized + 'static {
    type SubStage: SubStage;
    type Body: TaskBody;

    /// Workflow kind; the first part of every task address. Must not
    /// contain a colon.
    const KIND: &'static str;

    /// Human-readable phase name for status views.
    fn display_name(&self) -> &'static str {
        Self::KIND
    }

    /// Checks a creation request before anything is persisted.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    fn validate(&self, _task: &TaskOf<Self>) -> Result<(), String> {
        Ok(())
    }

    /// Decides what happens to an update repeating the current
    /// sub-stage. Override to accumulate answers from several senders.
    fn on_repeat(&self, _task: &TaskOf<Self>, _update: &TaskUpdate) -> Repeat {
        Repeat::Ignore
    }

    /// Workflow-specific merge step, run after the common fields and the
    /// body patch are merged.
    fn merge_custom(&self, _task: &mut TaskOf<Self>, _update: &TaskUpdate) {}

    /// Runs the current sub-stage.
    ///
    /// # Errors
    ///
    /// An error fails the task with the error as failure detail.
    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError>;

    /// Payload sent to the parent when this task finishes. Defaults to
    /// the task's resource links.
    fn finished_payload(&self, task: &TaskOf<Self>) -> CallbackPayload {
        CallbackPayload::with_resource_links(task.resource_links.clone())
    }

    /// Payload sent to the parent when this task fails or is cancelled.
    /// The failure detail is attached by the engine.
    fn failed_payload(&self, _task: &TaskOf<Self>) -> CallbackPayload {
        CallbackPayload::default()
    }

    /// Delete the record once it is terminal and the parent is notified.
    fn self_delete(&self) -> bool {
        false
    }
}
