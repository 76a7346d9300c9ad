//! The transition engine.
//!
//! [`TaskEngine`] owns the store handle, the registered workflows and one
//! mailbox per busy task address. Every update flows through the same
//! path:
//!
//! 1. [`send`](TaskEngine::send) queues it on the target's mailbox.
//! 2. The mailbox's drain loop decodes it for the target workflow and
//!    evaluates it against the stored record under compare-and-swap.
//! 3. An accepted update that lands on a runnable sub-stage invokes the
//!    workflow's handler once; a terminal one notifies the parent.
//!
//! Handlers never block on remote work. They spawn it through their
//! [`StageContext`] and return, and the completion comes back as another
//! update.

pub mod context;
pub(crate) mod driver;
pub(crate) mod mailbox;
pub mod transition;
pub mod workflow;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use crate::config::EngineConfig;
use crate::constants::{CANCELLED_MESSAGE, EXPIRED_MESSAGE_PREFIX};
use crate::domain::record::{Notification, TaskBody, TaskHeader, TaskRecord, TaskRequest};
use crate::error::TaskError;
use crate::retry::RetryPolicy;
use crate::store::TaskStore;
use crate::types::failure::{FailureDetail, FailureKind};
use crate::types::link::TaskAddress;
use crate::types::stage::TaskStage;
use crate::types::sub_stage::SubStage;
use crate::types::update::TaskUpdate;

use driver::{TypedDriver, WorkflowDriver};
use mailbox::{Envelope, Mailbox};

pub use context::StageContext;
pub use workflow::{CallbackPayload, Repeat, TaskOf, Workflow};

/// Published after every accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub address: TaskAddress,
    pub workflow: String,
    pub stage: TaskStage,
    pub sub_stage: String,
    /// 0..=100
    pub progress: u8,
    pub failure: Option<FailureDetail>,
}

impl TaskEvent {
    pub fn from_record<S: SubStage, B: TaskBody>(record: &TaskRecord<S, B>) -> Self {
        Self {
            address: record.address.clone(),
            workflow: record.workflow.clone(),
            stage: record.stage,
            sub_stage: record.sub_stage.name().to_string(),
            progress: if record.stage == TaskStage::Finished {
                100
            } else {
                record.sub_stage.progress()
            },
            failure: record.failure.clone(),
        }
    }
}

/// Result of a synchronously applied update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    /// `false` when the update was dropped as a duplicate, late or
    /// terminal-state update.
    pub accepted: bool,
    /// The record after evaluation.
    pub header: TaskHeader,
}

struct EngineInner {
    store: TaskStore,
    config: EngineConfig,
    drivers: DashMap<String, Arc<dyn WorkflowDriver>>,
    mailboxes: DashMap<TaskAddress, Arc<Mailbox>>,
    events: broadcast::Sender<TaskEvent>,
}

/// Cheaply cloneable handle to the engine.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use armada_tasks::config::EngineConfig;
/// use armada_tasks::domain::{NoBody, TaskRequest};
/// use armada_tasks::engine::{StageContext, TaskEngine, TaskOf, Workflow};
/// use armada_tasks::store::{memory::InMemoryBackend, TaskStore};
/// use armada_tasks::{DefaultSubStage, TaskError, TaskStage};
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
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let engine = TaskEngine::new(TaskStore::new(InMemoryBackend::new()), EngineConfig::default());
/// engine.register(Ping);
///
/// let address = engine.start::<Ping>(TaskRequest::new(NoBody {})).await.unwrap();
/// let header = engine
///     .await_terminal(&address, std::time::Duration::from_secs(5))
///     .await
///     .unwrap();
/// assert_eq!(header.stage, TaskStage::Finished);
/// # });
/// ```
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut workflows: Vec<String> = self
            .inner
            .drivers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        workflows.sort();
        f.debug_struct("TaskEngine")
            .field("store", &self.inner.store)
            .field("workflows", &workflows)
            .field("busy_tasks", &self.inner.mailboxes.len())
            .finish_non_exhaustive()
    }
}

impl TaskEngine {
    pub fn new(store: TaskStore, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(EngineInner {
                store,
                config,
                drivers: DashMap::new(),
                mailboxes: DashMap::new(),
                events,
            }),
        }
    }

    // ---- Registration ----

    /// Registers `workflow` under [`Workflow::KIND`], replacing any
    /// workflow registered under the same kind.
    pub fn register<W: Workflow>(&self, workflow: W) {
        let driver: Arc<dyn WorkflowDriver> = Arc::new(TypedDriver::new(workflow));
        if self
            .inner
            .drivers
            .insert(W::KIND.to_string(), driver)
            .is_some()
        {
            tracing::warn!(workflow = W::KIND, "replaced registered workflow");
        } else {
            tracing::debug!(workflow = W::KIND, "registered workflow");
        }
    }

    /// Returns `true` if a workflow is registered under `kind`.
    pub fn is_registered(&self, kind: &str) -> bool {
        self.inner.drivers.contains_key(kind)
    }

    /// The registered instance of workflow `W`.
    pub fn workflow<W: Workflow>(&self) -> Option<Arc<W>> {
        let driver = self.inner.drivers.get(W::KIND)?;
        driver
            .as_any()
            .downcast_ref::<TypedDriver<W>>()
            .map(|typed| Arc::clone(&typed.workflow))
    }

    pub(crate) fn driver_for(&self, kind: &str) -> Result<Arc<dyn WorkflowDriver>, TaskError> {
        self.inner
            .drivers
            .get(kind)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TaskError::UnknownWorkflow {
                workflow: kind.to_string(),
            })
    }

    // ---- Accessors ----

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Default policy for retried remote calls.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.config.retry
    }

    // ---- Task lifecycle ----

    /// Validates and persists a new task, then starts it.
    ///
    /// Starting a request whose explicit id is already stored returns the
    /// existing address without touching the record.
    ///
    /// # Errors
    ///
    /// - [`TaskError::UnknownWorkflow`] if `W` is not registered.
    /// - [`TaskError::Validation`] if the body or the workflow rejects the
    ///   request. Nothing is persisted.
    /// - Store errors from the initial write.
    pub async fn start<W: Workflow>(
        &self,
        mut request: TaskRequest<W::Body>,
    ) -> Result<TaskAddress, TaskError> {
        let workflow = self.workflow::<W>().ok_or_else(|| TaskError::UnknownWorkflow {
            workflow: W::KIND.to_string(),
        })?;
        let address = match request.id.as_deref() {
            Some(id) => TaskAddress::new(W::KIND, id),
            None => TaskAddress::generate(W::KIND),
        };
        if request.ttl_ms.is_none() {
            request.ttl_ms = self.inner.config.default_task_ttl_ms;
        }

        let mut record: TaskOf<W> = TaskRecord::new(address.clone(), request);
        if let Err(message) = record
            .body
            .validate()
            .and_then(|()| workflow.validate(&record))
        {
            tracing::warn!(address = %address, workflow = W::KIND, message = %message, "rejected task request");
            return Err(TaskError::Validation {
                workflow: W::KIND.to_string(),
                message,
            });
        }

        match self.inner.store.create(&mut record).await {
            Ok(()) => {}
            Err(TaskError::AlreadyExists { .. }) => {
                tracing::debug!(address = %address, "task already exists, start is a no-op");
                return Ok(address);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            address = %address,
            workflow = W::KIND,
            parent = record.callback.as_ref().map(|l| l.parent.as_str()).unwrap_or("-"),
            "created task"
        );
        self.publish(TaskEvent::from_record(&record));
        self.send(TaskUpdate::to_sub_stage(address.clone(), W::SubStage::CREATED));
        Ok(address)
    }

    /// Queues `update` for its target and returns immediately.
    pub fn send(&self, update: TaskUpdate) {
        let target = update.target.clone();
        self.enqueue(target, Envelope::Update { update, reply: None });
    }

    /// Queues `update` and waits until it has been evaluated.
    ///
    /// A stage handler must not call this for its own address; the reply
    /// would wait behind the handler itself. Use [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidTransition`] if the update was rejected.
    /// - [`TaskError::NotFound`] or [`TaskError::UnknownWorkflow`] for a
    ///   bad target.
    pub async fn apply(&self, update: TaskUpdate) -> Result<UpdateOutcome, TaskError> {
        let target = update.target.clone();
        self.send_with_receipt(update).await.map_err(|_| {
            TaskError::StoreError(format!("engine dropped the update for {target}"))
        })?
    }

    /// Queues `update` now; the receiver resolves once it was evaluated.
    pub(crate) fn send_with_receipt(
        &self,
        update: TaskUpdate,
    ) -> oneshot::Receiver<Result<UpdateOutcome, TaskError>> {
        let (reply, rx) = oneshot::channel();
        let target = update.target.clone();
        self.enqueue(
            target,
            Envelope::Update {
                update,
                reply: Some(reply),
            },
        );
        rx
    }

    pub async fn get<W: Workflow>(&self, address: &TaskAddress) -> Result<TaskOf<W>, TaskError> {
        self.inner.store.get(address).await
    }

    pub async fn header(&self, address: &TaskAddress) -> Result<TaskHeader, TaskError> {
        self.inner.store.header(address).await
    }

    /// Moves a non-terminal task to `CANCELLED`.
    ///
    /// The parent, if any, is notified through its fail target with a
    /// [`FailureKind::Cancelled`] detail. Remote calls already in flight
    /// keep running; their updates are ignored once they arrive.
    ///
    /// # Errors
    ///
    /// Same as [`apply`](Self::apply). Cancelling a terminal task is not an
    /// error; the outcome reports `accepted == false`.
    pub async fn cancel(&self, address: &TaskAddress) -> Result<UpdateOutcome, TaskError> {
        tracing::info!(address = %address, "cancelling task");
        self.apply(
            TaskUpdate::new(address.clone(), TaskStage::Cancelled)
                .with_failure(FailureDetail::new(FailureKind::Cancelled, CANCELLED_MESSAGE)),
        )
        .await
    }

    /// Polls the store until the task is terminal.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Timeout`] if the task is still running after
    ///   `timeout`.
    /// - [`TaskError::NotFound`] if the task does not exist, including a
    ///   self-deleting task that already finished.
    pub async fn await_terminal(
        &self,
        address: &TaskAddress,
        timeout: Duration,
    ) -> Result<TaskHeader, TaskError> {
        let started = tokio::time::Instant::now();
        let poll = self.inner.config.await_poll_interval();
        loop {
            let header = self.header(address).await?;
            if header.is_terminal() {
                return Ok(header);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(TaskError::Timeout {
                    address: address.to_string(),
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(poll.min(timeout - waited)).await;
        }
    }

    // ---- Recovery and housekeeping ----

    /// Picks up every stored task after a restart.
    ///
    /// `CREATED` tasks are started, `STARTED` tasks have their current
    /// sub-stage handler run again, and terminal tasks whose parent
    /// notification is still pending deliver it. Tasks of unregistered
    /// workflows are skipped. Returns the number of tasks resumed.
    ///
    /// # Errors
    ///
    /// Returns store errors from listing the records.
    pub async fn resume_all(&self) -> Result<usize, TaskError> {
        let mut resumed = 0;
        for header in self.inner.store.list_all().await? {
            if !self.is_registered(&header.workflow) {
                tracing::warn!(address = %header.address, workflow = %header.workflow, "not resuming task of unregistered workflow");
                continue;
            }
            match header.stage {
                TaskStage::Created => self.send(
                    TaskUpdate::new(header.address.clone(), TaskStage::Started)
                        .with_sub_stage_name(&header.sub_stage),
                ),
                TaskStage::Started => {
                    self.enqueue(header.address.clone(), Envelope::Resume { reply: None });
                }
                _ if header.notification == Notification::Pending => {
                    self.enqueue(header.address.clone(), Envelope::Resume { reply: None });
                }
                _ => continue,
            }
            resumed += 1;
        }
        tracing::info!(resumed, "resumed stored tasks");
        Ok(resumed)
    }

    /// Fails every non-terminal task whose expiry has passed. Returns the
    /// number of tasks failed.
    ///
    /// # Errors
    ///
    /// Returns store errors from listing the records.
    pub async fn expire_overdue(&self) -> Result<usize, TaskError> {
        let mut expired = 0;
        for header in self.inner.store.list_all().await? {
            if header.is_terminal() || !header.is_expired() {
                continue;
            }
            let failure = FailureDetail::new(
                FailureKind::Expired,
                format!("{EXPIRED_MESSAGE_PREFIX} {}", header.describe()),
            );
            tracing::warn!(address = %header.address, stage = %header.describe(), "task expired");
            self.send(TaskUpdate::failed(header.address, failure));
            expired += 1;
        }
        Ok(expired)
    }

    // ---- Events ----

    /// Subscribes to transition events. Slow receivers lose the oldest
    /// events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn publish(&self, event: TaskEvent) {
        // No receivers is not an error.
        let _ = self.inner.events.send(event);
    }
}
