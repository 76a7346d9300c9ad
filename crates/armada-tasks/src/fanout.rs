//! In-process fan-out/fan-in.
//!
//! A sub-stage that must finish K independent remote operations before it
//! advances issues them with [`fan_out`]. Completions arrive in any order
//! and on any thread; [`FanIn`] folds them into a single outcome:
//!
//! - every success decrements the counter, and the one that reaches zero
//!   proceeds, unless a failure was recorded;
//! - the first failure wins a compare-and-swap and fails the owner; later
//!   failures are only logged;
//! - a completion whose id was already handled is a duplicate and changes
//!   nothing.
//!
//! Fan-in over child *tasks* (which must survive a restart) uses the
//! durable [`counter`](crate::counter) workflow instead.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::TaskEngine;
use crate::types::failure::FailureDetail;
use crate::types::link::TaskAddress;
use crate::types::update::TaskUpdate;

/// What a single completion means for the whole fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanInOutcome {
    /// Successes still outstanding.
    Pending { remaining: usize },
    /// This completion was the last success; advance.
    Proceed,
    /// This completion is the first failure; fail the owner with it.
    Fail(FailureDetail),
    /// The id was already counted.
    Duplicate,
    /// A failure was already surfaced; only log.
    AlreadyFailed,
}

/// Shared counter, handled-id set and first-error flag.
///
/// # Examples
///
/// ```
/// use armada_tasks::fanout::{FanIn, FanInOutcome};
/// use armada_tasks::FailureDetail;
///
/// let fan_in = FanIn::new(2);
/// assert_eq!(fan_in.record_success("a", 1), FanInOutcome::Pending { remaining: 1 });
/// assert_eq!(fan_in.record_success("a", 1), FanInOutcome::Duplicate);
/// assert_eq!(fan_in.record_success("b", 2), FanInOutcome::Proceed);
///
/// let fan_in = FanIn::<()>::new(3);
/// let first = FailureDetail::remote("first");
/// assert_eq!(fan_in.record_failure("x", first.clone()), FanInOutcome::Fail(first));
/// assert_eq!(fan_in.record_failure("y", FailureDetail::remote("second")), FanInOutcome::AlreadyFailed);
/// ```
#[derive(Debug)]
pub struct FanIn<T> {
    expected: usize,
    remaining: AtomicUsize,
    failed: AtomicBool,
    handled: Mutex<HashSet<String>>,
    results: Mutex<Vec<T>>,
}

impl<T> FanIn<T> {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            remaining: AtomicUsize::new(expected),
            failed: AtomicBool::new(false),
            handled: Mutex::new(HashSet::with_capacity(expected)),
            results: Mutex::new(Vec::with_capacity(expected)),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn first_delivery(&self, id: &str) -> bool {
        self.handled.lock().insert(id.to_string())
    }

    /// Records a successful completion of operation `id`.
    pub fn record_success(&self, id: &str, value: T) -> FanInOutcome {
        if !self.first_delivery(id) {
            return FanInOutcome::Duplicate;
        }
        self.results.lock().push(value);
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        match previous {
            0 | 1 if self.has_failed() => FanInOutcome::AlreadyFailed,
            0 | 1 => FanInOutcome::Proceed,
            n => FanInOutcome::Pending { remaining: n - 1 },
        }
    }

    /// Records a failed completion of operation `id`. Failures mark the id
    /// handled but do not decrement the counter.
    pub fn record_failure(&self, id: &str, failure: FailureDetail) -> FanInOutcome {
        if !self.first_delivery(id) {
            return FanInOutcome::Duplicate;
        }
        if self
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            FanInOutcome::Fail(failure)
        } else {
            FanInOutcome::AlreadyFailed
        }
    }

    /// Successful results in completion order.
    pub fn take_results(&self) -> Vec<T> {
        std::mem::take(&mut *self.results.lock())
    }
}

/// Issues every operation concurrently and sends exactly one update to
/// `owner`: `on_complete(results)` when all succeed, or a fail update
/// carrying the first failure. An empty operation list completes at once.
///
/// Each operation is keyed by an id that identifies it for duplicate
/// detection. Results are passed in completion order.
pub fn fan_out<T, Fut, F>(
    engine: &TaskEngine,
    owner: TaskAddress,
    operations: Vec<(String, Fut)>,
    on_complete: F,
) where
    T: Send + 'static,
    Fut: Future<Output = Result<T, FailureDetail>> + Send + 'static,
    F: FnOnce(Vec<T>) -> TaskUpdate + Send + 'static,
{
    if operations.is_empty() {
        engine.send(on_complete(Vec::new()));
        return;
    }

    tracing::debug!(address = %owner, operations = operations.len(), "fanning out");
    let fan_in = Arc::new(FanIn::new(operations.len()));
    let on_complete = Arc::new(Mutex::new(Some(on_complete)));

    for (id, operation) in operations {
        let engine = engine.clone();
        let owner = owner.clone();
        let fan_in = Arc::clone(&fan_in);
        let on_complete = Arc::clone(&on_complete);
        tokio::spawn(async move {
            let outcome = match operation.await {
                Ok(value) => fan_in.record_success(&id, value),
                Err(failure) => fan_in.record_failure(&id, failure),
            };
            match outcome {
                FanInOutcome::Proceed => {
                    if let Some(complete) = on_complete.lock().take() {
                        engine.send(complete(fan_in.take_results()));
                    }
                }
                FanInOutcome::Fail(failure) => {
                    tracing::warn!(address = %owner, operation = %id, failure = %failure, "fan-out operation failed");
                    engine.send(TaskUpdate::failed(owner, failure));
                }
                FanInOutcome::AlreadyFailed => {
                    tracing::debug!(address = %owner, operation = %id, "fan-out already failed, ignoring completion");
                }
                FanInOutcome::Duplicate => {
                    tracing::debug!(address = %owner, operation = %id, "duplicate fan-out completion");
                }
                FanInOutcome::Pending { remaining } => {
                    tracing::debug!(address = %owner, operation = %id, remaining, "fan-out operation done");
                }
            }
        });
    }
}
