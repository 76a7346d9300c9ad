//! Type-erased per-workflow drivers.
//!
//! The engine routes by workflow kind and only knows drivers as
//! `Arc<dyn WorkflowDriver>`. [`TypedDriver`] restores the workflow's
//! sub-stage and body types, evaluates the transition rules, merges under
//! compare-and-swap and dispatches the handler.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::callback;
use crate::domain::record::{Notification, TaskLogLevel};
use crate::engine::context::StageContext;
use crate::engine::transition::{classify, settle, Transition};
use crate::engine::workflow::{Repeat, TaskOf, Workflow};
use crate::engine::{TaskEngine, TaskEvent, UpdateOutcome};
use crate::error::TaskError;
use crate::types::link::TaskAddress;
use crate::types::stage::TaskStage;
use crate::types::sub_stage::SubStage;
use crate::types::update::TaskUpdate;

#[async_trait]
pub(crate) trait WorkflowDriver: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Merges one update into the addressed task.
    async fn apply(&self, engine: &TaskEngine, update: TaskUpdate)
        -> Result<UpdateOutcome, TaskError>;

    /// Re-runs whatever a crash may have interrupted for one task.
    async fn resume(&self, engine: &TaskEngine, address: &TaskAddress) -> Result<(), TaskError>;
}

pub(crate) struct TypedDriver<W: Workflow> {
    pub(crate) workflow: Arc<W>,
}

/// Outcome of evaluating one update against the stored record.
enum Verdict {
    Accepted { dispatch: bool },
    Ignored(&'static str),
}

impl<W: Workflow> TypedDriver<W> {
    pub(crate) fn new(workflow: W) -> Self {
        Self {
            workflow: Arc::new(workflow),
        }
    }

    fn decode_body(update: &TaskUpdate) -> Result<Option<W::Body>, TaskError> {
        update
            .body
            .clone()
            .map(serde_json::from_value::<W::Body>)
            .transpose()
            .map_err(|e| TaskError::Validation {
                workflow: W::KIND.to_string(),
                message: format!("body patch for {} does not decode: {e}", update.target),
            })
    }

    fn decode_sub_stage(update: &TaskUpdate) -> Result<Option<W::SubStage>, TaskError> {
        match update.sub_stage.as_deref() {
            None => Ok(None),
            Some(name) => W::SubStage::from_name(name).map(Some).ok_or_else(|| {
                TaskError::InvalidTransition {
                    address: update.target.to_string(),
                    from: W::KIND.to_string(),
                    to: format!("{}({name})", update.stage),
                    suggested_action: Some(format!("{name} is not a sub-stage of {}", W::KIND)),
                }
            }),
        }
    }

    /// Evaluates and merges `update` into `task`. Runs inside the CAS
    /// loop, so it may be called more than once per update.
    fn evaluate(
        &self,
        task: &mut TaskOf<W>,
        update: &TaskUpdate,
        next_sub: Option<W::SubStage>,
        body: Option<&W::Body>,
    ) -> Result<Verdict, TaskError> {
        let (stage, sub_stage, dispatch) =
            match classify(task.stage, task.sub_stage, update.stage, next_sub) {
                Transition::AlreadyTerminal => {
                    if update.stage == TaskStage::Failed && task.stage == TaskStage::Failed {
                        tracing::warn!(address = %task.address, "task already failed");
                    }
                    return Ok(Verdict::Ignored("task is terminal"));
                }
                Transition::Late => return Ok(Verdict::Ignored("late update for passed sub-stage")),
                Transition::StageBackward | Transition::Illegal => {
                    return Err(TaskError::InvalidTransition {
                        address: task.address.to_string(),
                        from: task.describe(),
                        to: format!(
                            "{}({})",
                            update.stage,
                            update.sub_stage.as_deref().unwrap_or(task.sub_stage.name())
                        ),
                        suggested_action: None,
                    });
                }
                Transition::Repeat => match self.workflow.on_repeat(task, update) {
                    Repeat::Ignore => return Ok(Verdict::Ignored("repeated sub-stage")),
                    Repeat::Merge => (task.stage, task.sub_stage, false),
                    Repeat::MergeAndDispatch => (task.stage, task.sub_stage, true),
                },
                Transition::Advance { stage, sub_stage } => (stage, sub_stage, true),
            };

        task.merge_update(stage, sub_stage, update, body.cloned());
        self.workflow.merge_custom(task, update);
        if settle(task) && task.callback.is_some() {
            task.notification = Notification::Pending;
        }
        Ok(Verdict::Accepted { dispatch })
    }

    async fn dispatch(&self, engine: &TaskEngine, task: TaskOf<W>) {
        let address = task.address.clone();
        let sub_stage = task.sub_stage;
        let ctx = StageContext::<W>::new(engine.clone(), address.clone());
        if let Err(e) = self.workflow.handle(ctx, task).await {
            tracing::warn!(
                address = %address,
                workflow = W::KIND,
                sub_stage = sub_stage.name(),
                error = %e,
                "stage handler failed"
            );
            engine.send(TaskUpdate::failed(address, e.to_failure()));
        }
    }

    fn should_dispatch(task: &TaskOf<W>) -> bool {
        task.stage == TaskStage::Started
            && task.sub_stage != W::SubStage::COMPLETED
            && task.sub_stage != W::SubStage::ERROR
    }
}

fn log_move(level: TaskLogLevel, address: &TaskAddress, from: &str, to: &str) {
    match level {
        TaskLogLevel::Info => tracing::info!(address = %address, "Moving from {from} to {to}"),
        TaskLogLevel::Debug => tracing::debug!(address = %address, "Moving from {from} to {to}"),
    }
}

#[async_trait]
impl<W: Workflow> WorkflowDriver for TypedDriver<W> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn apply(
        &self,
        engine: &TaskEngine,
        update: TaskUpdate,
    ) -> Result<UpdateOutcome, TaskError> {
        let next_sub = Self::decode_sub_stage(&update)?;
        let body = Self::decode_body(&update)?;

        let mut previous = String::new();
        let mut verdict = Verdict::Ignored("not evaluated");
        let (task, written) = engine
            .store()
            .modify(&update.target, |task: &mut TaskOf<W>| {
                previous = task.describe();
                verdict = self.evaluate(task, &update, next_sub, body.as_ref())?;
                Ok(matches!(verdict, Verdict::Accepted { .. }))
            })
            .await?;

        let dispatch = match verdict {
            Verdict::Ignored(reason) => {
                tracing::debug!(
                    address = %task.address,
                    current = %task.describe(),
                    requested = %update.stage,
                    sub_stage = update.sub_stage.as_deref().unwrap_or("-"),
                    reason,
                    "update ignored"
                );
                return Ok(UpdateOutcome {
                    accepted: false,
                    header: task.header(),
                });
            }
            Verdict::Accepted { dispatch } => dispatch && written,
        };

        let current = task.describe();
        if previous != current {
            log_move(task.log_level, &task.address, &previous, &current);
        }
        engine.publish(TaskEvent::from_record(&task));
        let outcome = UpdateOutcome {
            accepted: true,
            header: task.header(),
        };

        if task.is_terminal() {
            if let Some(failure) = &task.failure {
                tracing::warn!(
                    address = %task.address,
                    workflow = W::KIND,
                    stage = %task.stage,
                    failure = %failure,
                    "task did not finish"
                );
            }
            callback::settle_terminal(engine, self.workflow.as_ref(), &task).await?;
        } else if dispatch && Self::should_dispatch(&task) {
            self.dispatch(engine, task).await;
        }
        Ok(outcome)
    }

    async fn resume(&self, engine: &TaskEngine, address: &TaskAddress) -> Result<(), TaskError> {
        let task: TaskOf<W> = engine.store().get(address).await?;
        if task.is_terminal() {
            if task.notification == Notification::Pending {
                tracing::info!(address = %address, "re-delivering pending parent notification");
                callback::settle_terminal(engine, self.workflow.as_ref(), &task).await?;
            }
            return Ok(());
        }
        if Self::should_dispatch(&task) {
            tracing::info!(
                address = %address,
                workflow = W::KIND,
                sub_stage = task.sub_stage.name(),
                "restarting task"
            );
            self.dispatch(engine, task).await;
        }
        Ok(())
    }
}
