//! Parent notification for terminal tasks.
//!
//! A child created with a [`TaskLink`](crate::TaskLink) owes its parent
//! exactly one update. Delivery is two-phase:
//!
//! 1. The terminal merge marks the record's notification `Pending` in the
//!    same compare-and-swap write that makes it terminal.
//! 2. [`settle_terminal`] queues the parent update. Once the parent has
//!    evaluated it under its own compare-and-swap, the record flips to
//!    `Delivered` and a self-deleting task is removed.
//!
//! Terminal records ignore every later update, so a duplicate `FINISHED`
//! never reaches step 2 again. A crash before the parent persisted the
//! update leaves the record `Pending`, and
//! [`TaskEngine::resume_all`](crate::engine::TaskEngine::resume_all)
//! delivers it again; parents drop such repeats through their own
//! transition rules.

use crate::domain::record::Notification;
use crate::engine::workflow::{CallbackPayload, TaskOf, Workflow};
use crate::engine::TaskEngine;
use crate::error::TaskError;
use crate::types::failure::FailureDetail;
use crate::types::link::{TaskAddress, TaskLink};
use crate::types::stage::TaskStage;
use crate::types::update::TaskUpdate;

/// Builds the update a terminal child sends through `link`.
///
/// A finished child sends its finished payload to the link's finish
/// target. A failed or cancelled child sends its failed payload and its
/// failure detail, tagged with the child address, to the fail target.
///
/// # Examples
///
/// ```
/// use armada_tasks::callback::compose_parent_update;
/// use armada_tasks::engine::CallbackPayload;
/// use armada_tasks::{DefaultSubStage, FailureDetail, TaskAddress, TaskLink, TaskStage};
///
/// let parent = TaskAddress::new("container-host-provisioning", "1");
/// let child = TaskAddress::new("compute-provision", "2");
/// let link = TaskLink::new(parent.clone(), DefaultSubStage::Processing);
///
/// let update = compose_parent_update(
///     &link,
///     &child,
///     TaskStage::Failed,
///     Some(&FailureDetail::remote("host unreachable")),
///     CallbackPayload::default(),
/// );
/// assert_eq!(update.target, parent);
/// assert_eq!(update.sub_stage.as_deref(), Some("ERROR"));
/// let failure = update.failure.unwrap();
/// assert_eq!(failure.message, "host unreachable");
/// assert_eq!(failure.source_address.as_deref(), Some("compute-provision:2"));
/// ```
pub fn compose_parent_update(
    link: &TaskLink,
    child: &TaskAddress,
    stage: TaskStage,
    failure: Option<&FailureDetail>,
    payload: CallbackPayload,
) -> TaskUpdate {
    let mut update = TaskUpdate::to_target(link.parent.clone(), link.target_for(stage))
        .with_resource_links(payload.resource_links)
        .with_custom_properties(payload.custom_properties)
        .with_source(child.as_str());
    if let Some(body) = payload.body {
        update = update.with_body(body);
    }
    if stage != TaskStage::Finished {
        let failure = failure.cloned().unwrap_or_else(|| {
            FailureDetail::internal(format!("child task {child} ended in {stage}"))
        });
        update = update.with_failure(failure.with_source(child.as_str()));
    }
    update
}

/// Notifies the parent of a terminal task and applies self-deletion.
///
/// Does nothing for the notification unless it is `Pending`. The parent
/// update is queued before this returns; marking it delivered waits for
/// the parent's verdict in a spawned task, so the child's mailbox never
/// waits on the parent's.
///
/// # Errors
///
/// Returns store errors from settling a task that owes no notification.
pub(crate) async fn settle_terminal<W: Workflow>(
    engine: &TaskEngine,
    workflow: &W,
    task: &TaskOf<W>,
) -> Result<(), TaskError> {
    let self_delete = workflow.self_delete();
    let link = match (&task.callback, task.notification) {
        (Some(link), Notification::Pending) => link,
        (None, Notification::Pending) => {
            return finish_delivery::<W>(engine, &task.address, self_delete).await;
        }
        _ => {
            if self_delete {
                delete_terminal(engine, &task.address).await?;
            }
            return Ok(());
        }
    };

    let payload = if task.stage == TaskStage::Finished {
        workflow.finished_payload(task)
    } else {
        workflow.failed_payload(task)
    };
    let update = compose_parent_update(link, &task.address, task.stage, task.failure.as_ref(), payload);
    tracing::debug!(
        address = %task.address,
        parent = %link.parent,
        target = %link.target_for(task.stage),
        "notifying parent"
    );
    let receipt = engine.send_with_receipt(update);

    let engine = engine.clone();
    let address = task.address.clone();
    let parent = link.parent.clone();
    tokio::spawn(async move {
        let delivered = match receipt.await {
            // Accepted, or dropped as late, repeated or terminal.
            Ok(Ok(_)) => true,
            Ok(Err(
                e @ (TaskError::InvalidTransition { .. }
                | TaskError::NotFound { .. }
                | TaskError::UnknownWorkflow { .. }
                | TaskError::Validation { .. }),
            )) => {
                tracing::warn!(address = %address, parent = %parent, error = %e, "parent refused notification");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(address = %address, parent = %parent, error = %e, "parent notification left pending");
                false
            }
            Err(_) => false,
        };
        if delivered {
            if let Err(e) = finish_delivery::<W>(&engine, &address, self_delete).await {
                tracing::warn!(address = %address, error = %e, "failed to settle delivered notification");
            }
        }
    });
    Ok(())
}

async fn finish_delivery<W: Workflow>(
    engine: &TaskEngine,
    address: &TaskAddress,
    self_delete: bool,
) -> Result<(), TaskError> {
    engine
        .store()
        .modify(address, |record: &mut TaskOf<W>| {
            if record.notification == Notification::Pending {
                record.notification = Notification::Delivered;
                Ok(true)
            } else {
                Ok(false)
            }
        })
        .await?;
    if self_delete {
        delete_terminal(engine, address).await?;
    }
    Ok(())
}

async fn delete_terminal(engine: &TaskEngine, address: &TaskAddress) -> Result<(), TaskError> {
    tracing::debug!(address = %address, "deleting terminal task");
    engine.store().delete(address).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::failure::FailureKind;
    use crate::types::sub_stage::DefaultSubStage;
    use serde_json::json;

    fn link() -> TaskLink {
        TaskLink::new(TaskAddress::new("parent", "1"), DefaultSubStage::Processing)
    }

    #[test]
    fn finished_child_sends_payload_to_finish_target() {
        let child = TaskAddress::new("child", "2");
        let payload = CallbackPayload::with_resource_links(["/r/a".to_string()].into())
            .with_custom_property("host", "h1")
            .with_body(json!({"selected": "h1"}));
        let update = compose_parent_update(&link(), &child, TaskStage::Finished, None, payload);

        assert_eq!(update.stage, TaskStage::Started);
        assert_eq!(update.sub_stage.as_deref(), Some("PROCESSING"));
        assert_eq!(update.resource_links.len(), 1);
        assert_eq!(update.custom_properties["host"], "h1");
        assert_eq!(update.body, Some(json!({"selected": "h1"})));
        assert_eq!(update.source.as_deref(), Some("child:2"));
        assert!(update.failure.is_none());
    }

    #[test]
    fn cancelled_child_forwards_cancellation() {
        let child = TaskAddress::new("child", "2");
        let failure = FailureDetail::new(FailureKind::Cancelled, "Task cancelled");
        let update = compose_parent_update(
            &link(),
            &child,
            TaskStage::Cancelled,
            Some(&failure),
            CallbackPayload::default(),
        );
        assert_eq!(update.sub_stage.as_deref(), Some("ERROR"));
        assert_eq!(update.failure.map(|f| f.kind), Some(FailureKind::Cancelled));
    }

    #[test]
    fn first_failure_source_is_preserved() {
        let child = TaskAddress::new("child", "2");
        let failure = FailureDetail::remote("disk full").with_source("grandchild:3");
        let update = compose_parent_update(
            &link(),
            &child,
            TaskStage::Failed,
            Some(&failure),
            CallbackPayload::default(),
        );
        let forwarded = update.failure.unwrap();
        assert_eq!(forwarded.message, "disk full");
        assert_eq!(forwarded.source_address.as_deref(), Some("grandchild:3"));
    }
}
