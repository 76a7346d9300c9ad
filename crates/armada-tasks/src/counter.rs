//! Durable fan-in over child tasks.
//!
//! A parent that spawns K child tasks and must wait for all of them starts
//! one [`CounterWorkflow`] task expecting K completions, linked back to
//! itself, and links every child to the counter's `COUNTING` sub-stage.
//! The counter keeps the remaining count and the handled child addresses
//! in its record, so redelivered completions are dropped even across a
//! restart. The first child failure fails the counter, which forwards the
//! child's failure detail to the parent. When the count reaches zero the
//! counter finishes and hands the accumulated resource links to the parent.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::record::{overwrite_if_some, TaskBody};
use crate::engine::{Repeat, StageContext, TaskOf, Workflow};
use crate::error::TaskError;
use crate::types::sub_stage::SubStage;
use crate::types::update::TaskUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterSubStage {
    Created,
    Counting,
    Completed,
    Error,
}

impl SubStage for CounterSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[Self::Created, Self::Counting, Self::Completed, Self::Error];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Counting => "COUNTING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterBody {
    #[serde(default)]
    pub completions_remaining: Option<u64>,
    /// Addresses of the children already counted.
    #[serde(default)]
    pub handled: BTreeSet<String>,
}

impl CounterBody {
    pub fn expecting(completions: u64) -> Self {
        Self {
            completions_remaining: Some(completions),
            handled: BTreeSet::new(),
        }
    }
}

impl TaskBody for CounterBody {
    fn merge(&mut self, patch: Self) {
        overwrite_if_some(&mut self.completions_remaining, patch.completions_remaining);
        self.handled.extend(patch.handled);
    }

    fn validate(&self) -> Result<(), String> {
        match self.completions_remaining {
            Some(_) => Ok(()),
            None => Err("completionsRemaining is required".to_string()),
        }
    }
}

/// Counts child completions; see the module docs.
///
/// # Examples
///
/// ```
/// use armada_tasks::config::EngineConfig;
/// use armada_tasks::counter::{CounterBody, CounterSubStage, CounterWorkflow};
/// use armada_tasks::domain::TaskRequest;
/// use armada_tasks::engine::TaskEngine;
/// use armada_tasks::store::{memory::InMemoryBackend, TaskStore};
/// use armada_tasks::{TaskAddress, TaskStage, TaskUpdate};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let engine = TaskEngine::new(TaskStore::new(InMemoryBackend::new()), EngineConfig::default());
/// engine.register(CounterWorkflow);
///
/// let counter = engine
///     .start::<CounterWorkflow>(TaskRequest::new(CounterBody::expecting(2)))
///     .await
///     .unwrap();
/// for child in ["a", "b", "a"] {
///     engine.send(
///         TaskUpdate::to_sub_stage(counter.clone(), CounterSubStage::Counting)
///             .with_source(TaskAddress::new("child", child).as_str()),
///     );
/// }
/// let header = engine
///     .await_terminal(&counter, std::time::Duration::from_secs(5))
///     .await
///     .unwrap();
/// assert_eq!(header.stage, TaskStage::Finished);
/// # });
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterWorkflow;

impl CounterWorkflow {
    /// A completion is counted when it targets `COUNTING` and comes from a
    /// source not seen before.
    fn is_new_completion(task: &TaskOf<Self>, update: &TaskUpdate) -> bool {
        update.sub_stage.as_deref() == Some(CounterSubStage::Counting.name())
            && update
                .source
                .as_ref()
                .is_some_and(|source| !task.body.handled.contains(source))
    }
}

#[async_trait]
impl Workflow for CounterWorkflow {
    type SubStage = CounterSubStage;
    type Body = CounterBody;
    const KIND: &'static str = "counter";

    fn display_name(&self) -> &'static str {
        "Counting child tasks"
    }

    fn on_repeat(&self, task: &TaskOf<Self>, update: &TaskUpdate) -> Repeat {
        if Self::is_new_completion(task, update) {
            Repeat::MergeAndDispatch
        } else {
            tracing::debug!(
                address = %task.address,
                source = update.source.as_deref().unwrap_or("-"),
                "ignoring repeated completion"
            );
            Repeat::Ignore
        }
    }

    fn merge_custom(&self, task: &mut TaskOf<Self>, update: &TaskUpdate) {
        if task.sub_stage != CounterSubStage::Counting || !Self::is_new_completion(task, update) {
            return;
        }
        if let Some(source) = &update.source {
            task.body.handled.insert(source.clone());
            let remaining = task.body.completions_remaining.unwrap_or(0).saturating_sub(1);
            task.body.completions_remaining = Some(remaining);
            tracing::debug!(address = %task.address, source = %source, remaining, "counted completion");
        }
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            CounterSubStage::Created => ctx.proceed(CounterSubStage::Counting),
            CounterSubStage::Counting => {
                if task.body.completions_remaining.unwrap_or(0) == 0 {
                    ctx.complete();
                }
            }
            CounterSubStage::Completed | CounterSubStage::Error => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::{TaskRecord, TaskRequest};
    use crate::types::link::TaskAddress;

    fn counting(remaining: u64) -> TaskOf<CounterWorkflow> {
        let mut task = TaskRecord::new(
            TaskAddress::new("counter", "1"),
            TaskRequest::new(CounterBody::expecting(remaining)),
        );
        task.sub_stage = CounterSubStage::Counting;
        task
    }

    fn completion(source: &str) -> TaskUpdate {
        TaskUpdate::to_sub_stage(TaskAddress::new("counter", "1"), CounterSubStage::Counting)
            .with_source(source)
    }

    #[test]
    fn each_source_counts_once() {
        let mut task = counting(2);
        let update = completion("child:a");
        assert_eq!(CounterWorkflow.on_repeat(&task, &update), Repeat::MergeAndDispatch);
        CounterWorkflow.merge_custom(&mut task, &update);
        assert_eq!(task.body.completions_remaining, Some(1));

        assert_eq!(CounterWorkflow.on_repeat(&task, &update), Repeat::Ignore);
        CounterWorkflow.merge_custom(&mut task, &update);
        assert_eq!(task.body.completions_remaining, Some(1));
    }

    #[test]
    fn self_addressed_counting_update_is_not_a_completion() {
        let task = counting(1);
        let update =
            TaskUpdate::to_sub_stage(task.address.clone(), CounterSubStage::Counting);
        assert_eq!(CounterWorkflow.on_repeat(&task, &update), Repeat::Ignore);
    }

    #[test]
    fn missing_count_is_rejected() {
        assert!(CounterBody::default().validate().is_err());
        assert!(CounterBody::expecting(0).validate().is_ok());
    }
}
