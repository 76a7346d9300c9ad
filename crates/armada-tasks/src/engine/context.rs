//! Handle a stage handler uses to report back.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use crate::domain::record::TaskRequest;
use crate::engine::workflow::Workflow;
use crate::engine::TaskEngine;
use crate::error::TaskError;
use crate::fanout;
use crate::retry::{invoke_with_retry, RetryPolicy, RetryableError};
use crate::store::TaskStore;
use crate::types::failure::FailureDetail;
use crate::types::link::{TaskAddress, TaskLink};
use crate::types::sub_stage::SubStage;
use crate::types::update::TaskUpdate;

/// Passed to [`Workflow::handle`] for one dispatch.
///
/// Everything a handler does to its own task goes through here as an
/// update addressed to itself. Remote work is spawned, never awaited in
/// the handler: the `spawn_*` and [`fan_out`](Self::fan_out) methods return
/// at once and send the resulting update when the work completes.
pub struct StageContext<W: Workflow> {
    engine: TaskEngine,
    address: TaskAddress,
    _workflow: PhantomData<fn() -> W>,
}

impl<W: Workflow> Clone for StageContext<W> {
    fn clone(&self) -> Self {
        Self::new(self.engine.clone(), self.address.clone())
    }
}

impl<W: Workflow> fmt::Debug for StageContext<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("workflow", &W::KIND)
            .field("address", &self.address)
            .finish()
    }
}

impl<W: Workflow> StageContext<W> {
    pub(crate) fn new(engine: TaskEngine, address: TaskAddress) -> Self {
        Self {
            engine,
            address,
            _workflow: PhantomData,
        }
    }

    pub fn address(&self) -> &TaskAddress {
        &self.address
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn store(&self) -> &TaskStore {
        self.engine.store()
    }

    /// The engine's default retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        *self.engine.retry_policy()
    }

    // ---- Self-addressed updates ----

    /// Update moving this task to `sub_stage`, for callers that attach a
    /// payload before sending.
    pub fn next(&self, sub_stage: W::SubStage) -> TaskUpdate {
        TaskUpdate::to_sub_stage(self.address.clone(), sub_stage)
    }

    pub fn send(&self, update: TaskUpdate) {
        self.engine.send(update);
    }

    pub fn proceed(&self, sub_stage: W::SubStage) {
        self.send(self.next(sub_stage));
    }

    pub fn complete(&self) {
        self.proceed(W::SubStage::COMPLETED);
    }

    pub fn fail(&self, failure: FailureDetail) {
        tracing::debug!(address = %self.address, failure = %failure, "failing task");
        self.send(TaskUpdate::failed(self.address.clone(), failure));
    }

    // ---- Composition ----

    /// Link a child uses to resume this task at `on_finish`, or at
    /// `ERROR` if the child fails.
    pub fn link(&self, on_finish: W::SubStage) -> TaskLink {
        TaskLink::new(self.address.clone(), on_finish)
    }

    pub fn link_with_fail(&self, on_finish: W::SubStage, on_fail: W::SubStage) -> TaskLink {
        TaskLink::with_fail(self.address.clone(), on_finish, on_fail)
    }

    /// Starts a child task of workflow `C`. The request should carry a
    /// link from [`link`](Self::link).
    ///
    /// # Errors
    ///
    /// See [`TaskEngine::start`].
    pub async fn start_child<C: Workflow>(
        &self,
        request: TaskRequest<C::Body>,
    ) -> Result<TaskAddress, TaskError> {
        let child = self.engine.start::<C>(request).await?;
        tracing::debug!(address = %self.address, child = %child, "started child task");
        Ok(child)
    }

    // ---- Remote work ----

    /// Runs `call` in the background under `policy` and sends
    /// `on_success(value)`, or fails this task with the last error.
    pub fn spawn_with_retry<T, E, F, Fut, S>(
        &self,
        operation: impl Into<String>,
        policy: RetryPolicy,
        call: F,
        on_success: S,
    ) where
        T: Send + 'static,
        E: RetryableError + Send + 'static,
        F: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        S: FnOnce(T) -> TaskUpdate + Send + 'static,
    {
        let engine = self.engine.clone();
        let address = self.address.clone();
        let operation = operation.into();
        tokio::spawn(async move {
            match invoke_with_retry(&operation, &policy, call).await {
                Ok(value) => engine.send(on_success(value)),
                Err(e) => {
                    tracing::warn!(address = %address, operation = %operation, attempts = e.attempts, error = %e, "remote call failed");
                    engine.send(TaskUpdate::failed(address, e.into_failure()));
                }
            }
        });
    }

    /// Runs `call` once in the background.
    pub fn spawn_call<T, Fut, S>(&self, operation: impl Into<String>, call: Fut, on_success: S)
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, FailureDetail>> + Send + 'static,
        S: FnOnce(T) -> TaskUpdate + Send + 'static,
    {
        let engine = self.engine.clone();
        let address = self.address.clone();
        let operation = operation.into();
        tokio::spawn(async move {
            match call.await {
                Ok(value) => engine.send(on_success(value)),
                Err(failure) => {
                    tracing::warn!(address = %address, operation = %operation, failure = %failure, "remote call failed");
                    engine.send(TaskUpdate::failed(address, failure));
                }
            }
        });
    }

    /// Issues `operations` concurrently; see [`fanout::fan_out`].
    pub fn fan_out<T, Fut, F>(&self, operations: Vec<(String, Fut)>, on_complete: F)
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, FailureDetail>> + Send + 'static,
        F: FnOnce(Vec<T>) -> TaskUpdate + Send + 'static,
    {
        fanout::fan_out(&self.engine, self.address.clone(), operations, on_complete);
    }
}
