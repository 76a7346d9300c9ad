//! Transition rules applied to every incoming update.
//!
//! [`classify`] is a pure function of the current `(stage, sub-stage)` and
//! the requested one. The engine turns its verdict into a merge, a silent
//! drop or a rejection.
//!
//! | Current | Requested | Verdict |
//! |---------|-----------|---------|
//! | terminal | anything | [`Transition::AlreadyTerminal`] |
//! | any | earlier stage | [`Transition::StageBackward`] |
//! | any | terminal stage | [`Transition::Advance`] |
//! | `CREATED(s)` | `STARTED(s)` | [`Transition::Advance`] |
//! | `X(s)` | `X(s)` | [`Transition::Repeat`] |
//! | `X(s)` | `Y(t)`, `s` may advance to `t` | [`Transition::Advance`] |
//! | `X(s)` | `Y(t)`, `t` transient or `X != Y` | [`Transition::Late`] |
//! | otherwise | | [`Transition::Illegal`] |

use crate::domain::record::TaskRecord;
use crate::types::failure::{FailureDetail, FailureKind};
use crate::types::stage::TaskStage;
use crate::types::sub_stage::SubStage;

/// Verdict for one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// The record is terminal; every update is dropped.
    AlreadyTerminal,
    /// The update would move the stage backwards.
    StageBackward,
    /// Move to `(stage, sub_stage)` and merge.
    Advance { stage: TaskStage, sub_stage: S },
    /// Same `(stage, sub-stage)`; the workflow decides via
    /// [`Workflow::on_repeat`](crate::engine::Workflow::on_repeat).
    Repeat,
    /// An out-of-order update for a sub-stage already passed. Dropped
    /// without error.
    Late,
    /// Not reachable per the workflow's transition table.
    Illegal,
}

/// Decides what to do with an update targeting `(next_stage, next_sub)`.
///
/// A missing `next_sub` means "keep the current sub-stage", except for
/// terminal stages, where it defaults to `COMPLETED` for `FINISHED`,
/// `ERROR` for `FAILED` and the current sub-stage for `CANCELLED`.
///
/// # Examples
///
/// ```
/// use armada_tasks::engine::transition::{classify, Transition};
/// use armada_tasks::{DefaultSubStage, TaskStage};
///
/// let verdict = classify(
///     TaskStage::Started,
///     DefaultSubStage::Processing,
///     TaskStage::Started,
///     Some(DefaultSubStage::Created),
/// );
/// assert_eq!(verdict, Transition::Illegal);
/// ```
pub fn classify<S: SubStage>(
    stage: TaskStage,
    sub_stage: S,
    next_stage: TaskStage,
    next_sub: Option<S>,
) -> Transition<S> {
    if stage.is_terminal() {
        return Transition::AlreadyTerminal;
    }
    if !stage.can_transition_to(&next_stage) {
        return Transition::StageBackward;
    }
    if next_stage.is_terminal() {
        let sub_stage = next_sub.unwrap_or(match next_stage {
            TaskStage::Finished => S::COMPLETED,
            TaskStage::Failed => S::ERROR,
            _ => sub_stage,
        });
        return Transition::Advance {
            stage: next_stage,
            sub_stage,
        };
    }

    let next_sub = next_sub.unwrap_or(sub_stage);
    if next_sub == sub_stage {
        return if stage == TaskStage::Created && next_stage == TaskStage::Started {
            Transition::Advance {
                stage: next_stage,
                sub_stage: next_sub,
            }
        } else {
            Transition::Repeat
        };
    }
    if sub_stage.can_advance_to(next_sub) {
        return Transition::Advance {
            stage: next_stage,
            sub_stage: next_sub,
        };
    }
    if next_sub.is_transient() || stage != next_stage {
        Transition::Late
    } else {
        Transition::Illegal
    }
}

/// Settles a record after a merge.
///
/// `STARTED(COMPLETED)` becomes `FINISHED` and `STARTED(ERROR)` becomes
/// `FAILED`. A failed or cancelled record always carries a failure detail.
/// Returns `true` if the record is terminal afterwards.
pub fn settle<S: SubStage, B>(record: &mut TaskRecord<S, B>) -> bool {
    if record.stage == TaskStage::Started {
        if record.sub_stage == S::COMPLETED {
            record.stage = TaskStage::Finished;
        } else if record.sub_stage == S::ERROR {
            record.stage = TaskStage::Failed;
        }
    }
    match record.stage {
        TaskStage::Failed if record.failure.is_none() => {
            record.failure = Some(FailureDetail::internal(format!(
                "Task failed in sub-stage {}",
                record.sub_stage.name()
            )));
        }
        TaskStage::Cancelled => {
            let cancelled = record
                .failure
                .as_ref()
                .is_some_and(|f| f.kind == FailureKind::Cancelled);
            if !cancelled {
                record.failure = Some(FailureDetail::new(
                    FailureKind::Cancelled,
                    crate::constants::CANCELLED_MESSAGE,
                ));
            }
        }
        _ => {}
    }
    record.stage.is_terminal()
}
