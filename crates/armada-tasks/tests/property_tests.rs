//! Property-based tests using proptest.
//!
//! Verifies merge idempotence, monotonic sub-stage progression under
//! arbitrary update streams, and order independence of fan-in.

use std::collections::BTreeSet;

use proptest::prelude::*;

use armada_tasks::domain::{NoBody, TaskRecord, TaskRequest};
use armada_tasks::engine::transition::{classify, settle, Transition};
use armada_tasks::fanout::{FanIn, FanInOutcome};
use armada_tasks::{DefaultSubStage, FailureDetail, SubStage, TaskAddress, TaskStage, TaskUpdate};

type Record = TaskRecord<DefaultSubStage, NoBody>;

// ─── Arbitrary Strategies ───────────────────────────────────────────────────

fn arb_sub_stage() -> impl Strategy<Value = DefaultSubStage> {
    prop::sample::select(DefaultSubStage::ALL.to_vec())
}

fn arb_stage() -> impl Strategy<Value = TaskStage> {
    prop::sample::select(vec![
        TaskStage::Created,
        TaskStage::Started,
        TaskStage::Started,
        TaskStage::Started,
        TaskStage::Cancelled,
        TaskStage::Finished,
        TaskStage::Failed,
    ])
}

fn arb_update() -> impl Strategy<Value = TaskUpdate> {
    (
        arb_stage(),
        proptest::option::of(arb_sub_stage()),
        prop::collection::btree_set("/r/[a-e]{1,2}", 0..4),
        prop::collection::btree_map("[a-c]", "[x-z]{1,3}", 0..3),
    )
        .prop_map(|(stage, sub_stage, links, properties)| {
            let mut update = TaskUpdate::new(TaskAddress::new("prop", "1"), stage)
                .with_resource_links(links)
                .with_custom_properties(properties);
            if let Some(sub_stage) = sub_stage {
                update = update.with_sub_stage_name(sub_stage.name());
            }
            update
        })
}

fn record() -> Record {
    TaskRecord::new(TaskAddress::new("prop", "1"), TaskRequest::new(NoBody {}))
}

/// Applies `update` the way the engine does, ignoring handlers.
fn apply(record: &mut Record, update: &TaskUpdate) -> bool {
    let next_sub = update
        .sub_stage
        .as_deref()
        .and_then(DefaultSubStage::from_name);
    match classify(record.stage, record.sub_stage, update.stage, next_sub) {
        Transition::Advance { stage, sub_stage } => {
            record.merge_update(stage, sub_stage, update, None);
            settle(record);
            true
        }
        _ => false,
    }
}

// ─── Merge Properties ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn merge_is_idempotent(update in arb_update()) {
        let mut once = record();
        once.merge_update(TaskStage::Started, DefaultSubStage::Processing, &update, None);
        let mut twice = once.clone();
        twice.merge_update(TaskStage::Started, DefaultSubStage::Processing, &update, None);

        prop_assert_eq!(&once.resource_links, &twice.resource_links);
        prop_assert_eq!(&once.custom_properties, &twice.custom_properties);
        prop_assert_eq!(once.resource_links.len(), update.resource_links.len());
    }

    #[test]
    fn links_are_never_lost(updates in prop::collection::vec(arb_update(), 1..12)) {
        let mut r = record();
        r.stage = TaskStage::Started;
        let mut expected = BTreeSet::new();
        for update in &updates {
            r.merge_update(TaskStage::Started, DefaultSubStage::Processing, update, None);
            expected.extend(update.resource_links.iter().cloned());
        }
        prop_assert_eq!(r.resource_links, expected);
    }
}

// ─── Progression Properties ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn accepted_updates_never_move_backwards(updates in prop::collection::vec(arb_update(), 1..20)) {
        let mut r = record();
        let mut previous = (r.stage, r.sub_stage.ordinal());
        let mut completions = 0;
        for update in &updates {
            let was_terminal = r.is_terminal();
            let accepted = apply(&mut r, update);
            if was_terminal {
                prop_assert!(!accepted);
            }
            let current = (r.stage, r.sub_stage.ordinal());
            prop_assert!(current.0 >= previous.0);
            if current.0 == previous.0 && r.sub_stage != DefaultSubStage::Error {
                prop_assert!(current.1 >= previous.1);
            }
            if accepted && r.stage == TaskStage::Finished {
                completions += 1;
            }
            previous = current;
        }
        prop_assert!(completions <= 1);
    }

    #[test]
    fn terminal_records_always_explain_failure(updates in prop::collection::vec(arb_update(), 1..20)) {
        let mut r = record();
        for update in &updates {
            apply(&mut r, update);
        }
        if matches!(r.stage, TaskStage::Failed | TaskStage::Cancelled) {
            prop_assert!(r.failure.is_some());
        }
    }
}

// ─── Fan-in Properties ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Completion {
    Success(usize),
    Failure(usize),
}

/// Five operations: 1 and 3 fail, 2, 4 and 5 succeed, and 2 is delivered
/// twice.
fn arb_interleaving() -> impl Strategy<Value = Vec<Completion>> {
    Just(vec![
        Completion::Failure(1),
        Completion::Success(2),
        Completion::Failure(3),
        Completion::Success(4),
        Completion::Success(5),
        Completion::Success(2),
    ])
    .prop_shuffle()
}

proptest! {
    #[test]
    fn fan_in_fails_once_with_first_recorded_failure(order in arb_interleaving()) {
        let fan_in = FanIn::new(5);
        let mut surfaced = Vec::new();
        let mut first_failure = None;
        for completion in &order {
            let outcome = match completion {
                Completion::Success(id) => fan_in.record_success(&id.to_string(), *id),
                Completion::Failure(id) => {
                    first_failure.get_or_insert(*id);
                    fan_in.record_failure(&id.to_string(), FailureDetail::remote(format!("op {id}")))
                }
            };
            prop_assert_ne!(&outcome, &FanInOutcome::Proceed);
            if let FanInOutcome::Fail(detail) = outcome {
                surfaced.push(detail.message);
            }
        }
        prop_assert_eq!(surfaced.len(), 1);
        prop_assert_eq!(surfaced[0].clone(), format!("op {}", first_failure.unwrap()));
        prop_assert_eq!(fan_in.remaining(), 2);
    }

    #[test]
    fn fan_in_proceeds_once_for_any_order(k in 1usize..12, seed in any::<u64>()) {
        let mut ids: Vec<usize> = (0..k).chain(0..k).collect();
        // Deterministic shuffle from the seed.
        let mut state = seed | 1;
        for i in (1..ids.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = usize::try_from(state % (i as u64 + 1)).unwrap();
            ids.swap(i, j);
        }

        let fan_in = FanIn::new(k);
        let proceeds = ids
            .iter()
            .map(|id| fan_in.record_success(&id.to_string(), *id))
            .filter(|o| *o == FanInOutcome::Proceed)
            .count();
        prop_assert_eq!(proceeds, 1);
        let mut results = fan_in.take_results();
        results.sort_unstable();
        prop_assert_eq!(results, (0..k).collect::<Vec<_>>());
    }
}
