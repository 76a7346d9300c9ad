//! Integration tests for task composition.
//!
//! Parent/child links, exactly-once parent notification, durable fan-in
//! through the counter workflow, cancellation, self-deletion and
//! compensating cleanup.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use armada_tasks::compensator::{Compensator, ResourceQuery};
use armada_tasks::config::EngineConfig;
use armada_tasks::counter::{CounterBody, CounterSubStage, CounterWorkflow};
use armada_tasks::domain::{NoBody, Notification, TaskRecord, TaskRequest};
use armada_tasks::engine::{CallbackPayload, Repeat, StageContext, TaskEngine, TaskOf, Workflow};
use armada_tasks::store::memory::InMemoryBackend;
use armada_tasks::store::TaskStore;
use armada_tasks::{
    DefaultSubStage, FailureDetail, FailureKind, SubStage, TaskAddress, TaskError, TaskLink,
    TaskStage, TaskUpdate, CANCELLED_MESSAGE,
};

const WAIT: Duration = Duration::from_secs(5);

// ─── Test Workflows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum InboxStage {
    Created,
    Waiting,
    Received,
    Completed,
    Error,
}

impl SubStage for InboxStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::Waiting,
        Self::Received,
        Self::Completed,
        Self::Error,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Waiting => "WAITING",
            Self::Received => "RECEIVED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

/// Parent that records every delivery to `RECEIVED`, duplicates included.
#[derive(Default)]
struct Inbox {
    deliveries: Arc<Mutex<Vec<Option<String>>>>,
}

#[async_trait]
impl Workflow for Inbox {
    type SubStage = InboxStage;
    type Body = NoBody;
    const KIND: &'static str = "inbox";

    fn on_repeat(&self, _task: &TaskOf<Self>, _update: &TaskUpdate) -> Repeat {
        Repeat::MergeAndDispatch
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            InboxStage::Created => ctx.proceed(InboxStage::Waiting),
            InboxStage::Received => {
                self.deliveries
                    .lock()
                    .push(task.custom_properties.get("from").cloned());
            }
            InboxStage::Waiting | InboxStage::Completed | InboxStage::Error => {}
        }
        Ok(())
    }
}

/// Child driven entirely by test updates.
#[derive(Default)]
struct Child {
    self_delete: bool,
}

#[async_trait]
impl Workflow for Child {
    type SubStage = DefaultSubStage;
    type Body = NoBody;
    const KIND: &'static str = "child";

    async fn handle(&self, _ctx: StageContext<Self>, _task: TaskOf<Self>) -> Result<(), TaskError> {
        Ok(())
    }

    fn finished_payload(&self, task: &TaskOf<Self>) -> CallbackPayload {
        let mut payload = CallbackPayload::with_resource_links(task.resource_links.clone());
        payload.custom_properties = task.custom_properties.clone();
        payload
    }

    fn self_delete(&self) -> bool {
        self.self_delete
    }
}

fn engine() -> TaskEngine {
    TaskEngine::new(TaskStore::new(InMemoryBackend::new()), EngineConfig::default())
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_sub_stage(engine: &TaskEngine, address: &TaskAddress, sub_stage: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while engine.header(address).await.unwrap().sub_stage != sub_stage {
        assert!(tokio::time::Instant::now() < deadline, "never reached {sub_stage}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_notification(engine: &TaskEngine, address: &TaskAddress, expected: Notification) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while engine.header(address).await.unwrap().notification != expected {
        assert!(tokio::time::Instant::now() < deadline, "notification never {expected:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Starts a waiting inbox and a child linked to its `RECEIVED` sub-stage.
async fn parent_and_child(engine: &TaskEngine) -> (TaskAddress, TaskAddress) {
    let inbox = engine.start::<Inbox>(TaskRequest::new(NoBody {})).await.unwrap();
    wait_for_sub_stage(engine, &inbox, "WAITING").await;
    let child = engine
        .start::<Child>(
            TaskRequest::new(NoBody {})
                .with_callback(TaskLink::new(inbox.clone(), InboxStage::Received)),
        )
        .await
        .unwrap();
    (inbox, child)
}

// ─── Parent Notification ────────────────────────────────────────────────────

mod callback_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_duplicate_finished_notifies_parent_once() {
        let engine = engine();
        let inbox = Inbox::default();
        let deliveries = Arc::clone(&inbox.deliveries);
        engine.register(inbox);
        engine.register(Child::default());
        let (_, child) = parent_and_child(&engine).await;

        let finished = TaskUpdate::new(child.clone(), TaskStage::Finished)
            .with_custom_property("from", "child");
        let first = engine.apply(finished.clone()).await.unwrap();
        let second = engine.apply(finished).await.unwrap();
        assert!(first.accepted);
        assert!(!second.accepted);

        wait_until(|| !deliveries.lock().is_empty()).await;
        wait_for_notification(&engine, &child, Notification::Delivered).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*deliveries.lock(), vec![Some("child".to_string())]);
    }

    #[tokio::test]
    async fn test_child_failure_reaches_parent_with_origin() {
        let engine = engine();
        engine.register(Inbox::default());
        engine.register(Child::default());
        let (inbox, child) = parent_and_child(&engine).await;

        engine.send(TaskUpdate::failed(
            child.clone(),
            FailureDetail::remote("host unreachable").with_status_code(503),
        ));
        let header = engine.await_terminal(&inbox, WAIT).await.unwrap();

        assert_eq!(header.stage, TaskStage::Failed);
        let failure = header.failure.unwrap();
        assert_eq!(failure.message, "host unreachable");
        assert_eq!(failure.status_code, Some(503));
        assert_eq!(failure.source_address.as_deref(), Some(child.as_str()));
    }

    #[tokio::test]
    async fn test_cancelled_child_fails_parent() {
        let engine = engine();
        engine.register(Inbox::default());
        engine.register(Child::default());
        let (inbox, child) = parent_and_child(&engine).await;

        let outcome = engine.cancel(&child).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.header.stage, TaskStage::Cancelled);

        let header = engine.await_terminal(&inbox, WAIT).await.unwrap();
        assert_eq!(header.stage, TaskStage::Failed);
        let failure = header.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.message, CANCELLED_MESSAGE);

        let again = engine.cancel(&child).await.unwrap();
        assert!(!again.accepted);
    }

    #[tokio::test]
    async fn test_pending_notification_is_redelivered_on_resume() {
        let engine = engine();
        let inbox = Inbox::default();
        let deliveries = Arc::clone(&inbox.deliveries);
        engine.register(inbox);
        engine.register(Child::default());
        let parent = engine.start::<Inbox>(TaskRequest::new(NoBody {})).await.unwrap();
        wait_for_sub_stage(&engine, &parent, "WAITING").await;

        // A child that crashed after becoming terminal but before notifying.
        let mut record: TaskOf<Child> = TaskRecord::new(
            TaskAddress::new("child", "crashed"),
            TaskRequest::new(NoBody {})
                .with_callback(TaskLink::new(parent.clone(), InboxStage::Received))
                .with_custom_property("from", "crashed"),
        );
        record.stage = TaskStage::Finished;
        record.sub_stage = DefaultSubStage::Completed;
        record.notification = Notification::Pending;
        engine.store().create(&mut record).await.unwrap();

        assert_eq!(engine.resume_all().await.unwrap(), 2);
        wait_until(|| !deliveries.lock().is_empty()).await;
        assert_eq!(*deliveries.lock(), vec![Some("crashed".to_string())]);
        wait_for_notification(&engine, &record.address, Notification::Delivered).await;
    }

    #[tokio::test]
    async fn test_self_deleting_child_is_removed_after_notifying() {
        let engine = engine();
        let inbox = Inbox::default();
        let deliveries = Arc::clone(&inbox.deliveries);
        engine.register(inbox);
        engine.register(Child { self_delete: true });
        let (_, child) = parent_and_child(&engine).await;

        engine
            .apply(TaskUpdate::new(child.clone(), TaskStage::Finished))
            .await
            .unwrap();

        wait_until(|| deliveries.lock().len() == 1).await;
        let deadline = tokio::time::Instant::now() + WAIT;
        while !matches!(engine.header(&child).await, Err(TaskError::NotFound { .. })) {
            assert!(tokio::time::Instant::now() < deadline, "child record was not deleted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// ─── Counter Fan-in ─────────────────────────────────────────────────────────

mod counter_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn counter_with_children(
        engine: &TaskEngine,
        parent: &TaskAddress,
        children: usize,
    ) -> (TaskAddress, Vec<TaskAddress>) {
        let counter = engine
            .start::<CounterWorkflow>(
                TaskRequest::new(CounterBody::expecting(children as u64))
                    .with_callback(TaskLink::new(parent.clone(), InboxStage::Received)),
            )
            .await
            .unwrap();
        let mut addresses = Vec::new();
        for _ in 0..children {
            let child = engine
                .start::<Child>(
                    TaskRequest::new(NoBody {}).with_callback(TaskLink::new(
                        counter.clone(),
                        CounterSubStage::Counting,
                    )),
                )
                .await
                .unwrap();
            addresses.push(child);
        }
        (counter, addresses)
    }

    #[tokio::test]
    async fn test_counter_finishes_after_every_child() {
        let engine = engine();
        let inbox = Inbox::default();
        let deliveries = Arc::clone(&inbox.deliveries);
        engine.register(inbox);
        engine.register(Child::default());
        engine.register(CounterWorkflow);
        let parent = engine.start::<Inbox>(TaskRequest::new(NoBody {})).await.unwrap();
        wait_for_sub_stage(&engine, &parent, "WAITING").await;

        let (counter, children) = counter_with_children(&engine, &parent, 3).await;
        for (i, child) in children.iter().enumerate().rev() {
            let finished = TaskUpdate::new(child.clone(), TaskStage::Finished)
                .with_resource_links([format!("/r/{i}")]);
            engine.send(finished.clone());
            engine.send(finished);
        }

        let header = engine.await_terminal(&counter, WAIT).await.unwrap();
        assert_eq!(header.stage, TaskStage::Finished);
        assert_eq!(header.resource_links.len(), 3);

        wait_until(|| deliveries.lock().len() == 1).await;
        let parent_header = engine.header(&parent).await.unwrap();
        assert_eq!(parent_header.resource_links.len(), 3);
    }

    #[tokio::test]
    async fn test_first_child_failure_fails_counter_once() {
        let engine = engine();
        engine.register(Inbox::default());
        engine.register(Child::default());
        engine.register(CounterWorkflow);
        let parent = engine.start::<Inbox>(TaskRequest::new(NoBody {})).await.unwrap();
        wait_for_sub_stage(&engine, &parent, "WAITING").await;

        let (counter, children) = counter_with_children(&engine, &parent, 3).await;
        engine
            .apply(TaskUpdate::failed(children[1].clone(), FailureDetail::remote("first")))
            .await
            .unwrap();
        engine
            .apply(TaskUpdate::new(children[0].clone(), TaskStage::Finished))
            .await
            .unwrap();
        engine
            .apply(TaskUpdate::failed(children[2].clone(), FailureDetail::remote("second")))
            .await
            .unwrap();

        let header = engine.await_terminal(&counter, WAIT).await.unwrap();
        assert_eq!(header.stage, TaskStage::Failed);
        assert_eq!(header.failure.as_ref().unwrap().message, "first");

        let parent_header = engine.await_terminal(&parent, WAIT).await.unwrap();
        let failure = parent_header.failure.unwrap();
        assert_eq!(failure.message, "first");
        assert_eq!(failure.source_address.as_deref(), Some(children[1].as_str()));
    }

    #[tokio::test]
    async fn test_counter_expecting_zero_finishes_at_once() {
        let engine = engine();
        engine.register(CounterWorkflow);
        let counter = engine
            .start::<CounterWorkflow>(TaskRequest::new(CounterBody::expecting(0)))
            .await
            .unwrap();
        let header = engine.await_terminal(&counter, WAIT).await.unwrap();
        assert_eq!(header.stage, TaskStage::Finished);
    }
}

// ─── Compensation ───────────────────────────────────────────────────────────

mod compensator_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Resource tree with a delete log.
    struct Resources {
        children: BTreeMap<String, BTreeSet<String>>,
        correlated: BTreeMap<String, BTreeSet<String>>,
        deleted: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Resources {
        fn new(edges: &[(&str, &str)]) -> Self {
            let mut children: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for (parent, child) in edges {
                children
                    .entry((*parent).to_string())
                    .or_default()
                    .insert((*child).to_string());
            }
            Self {
                children,
                correlated: BTreeMap::new(),
                deleted: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl ResourceQuery for Resources {
        async fn query_by_correlation(
            &self,
            correlation_id: &str,
            _kind: Option<&str>,
        ) -> Result<BTreeSet<String>, FailureDetail> {
            Ok(self.correlated.get(correlation_id).cloned().unwrap_or_default())
        }

        async fn children_of(&self, link: &str) -> Result<BTreeSet<String>, FailureDetail> {
            Ok(self.children.get(link).cloned().unwrap_or_default())
        }

        async fn delete(&self, link: &str) -> Result<(), FailureDetail> {
            if self.fail_on.as_deref() == Some(link) {
                return Err(FailureDetail::remote(format!("cannot delete {link}")));
            }
            self.deleted.lock().push(link.to_string());
            Ok(())
        }
    }

    /// Removal task that hands its resource links to the compensator.
    struct Cleanup {
        compensator: Compensator<Resources>,
    }

    #[async_trait]
    impl Workflow for Cleanup {
        type SubStage = DefaultSubStage;
        type Body = NoBody;
        const KIND: &'static str = "cleanup";

        async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
            if task.sub_stage == DefaultSubStage::Created {
                let done = ctx.next(DefaultSubStage::Completed);
                self.compensator.run(
                    ctx.engine(),
                    task.address.clone(),
                    task.resource_links.clone(),
                    task.correlation_id.clone(),
                    move |_| done,
                );
            }
            Ok(())
        }
    }

    fn tree() -> Resources {
        Resources::new(&[
            ("/r/a", "/r/a/1"),
            ("/r/a/1", "/r/a/1/x"),
            ("/r/b", "/r/b/1"),
            ("/r/other", "/r/other/1"),
        ])
    }

    async fn run_cleanup(
        resources: Resources,
        links: &[&str],
    ) -> (TaskStage, Vec<String>) {
        run_cleanup_request(
            resources,
            TaskRequest::new(NoBody {}).with_resource_links(links.iter().copied()),
        )
        .await
    }

    async fn run_cleanup_request(
        resources: Resources,
        request: TaskRequest<NoBody>,
    ) -> (TaskStage, Vec<String>) {
        let resources = Arc::new(resources);
        let engine = engine();
        engine.register(Cleanup {
            compensator: Compensator::new(Arc::clone(&resources)),
        });
        let address = engine.start::<Cleanup>(request).await.unwrap();
        let header = engine.await_terminal(&address, WAIT).await.unwrap();
        let mut deleted = resources.deleted.lock().clone();
        deleted.sort();
        (header.stage, deleted)
    }

    #[tokio::test]
    async fn test_removes_exactly_the_descendants() {
        let (stage, deleted) = run_cleanup(tree(), &["/r/a", "/r/b", "/r/c"]).await;
        assert_eq!(stage, TaskStage::Finished);
        assert_eq!(
            deleted,
            vec!["/r/a", "/r/a/1", "/r/a/1/x", "/r/b", "/r/b/1", "/r/c"]
        );
    }

    #[tokio::test]
    async fn test_correlated_orphans_are_removed() {
        let mut resources = tree();
        resources
            .correlated
            .insert("ctx-9".to_string(), BTreeSet::from(["/r/orphan".to_string(), "/r/b".to_string()]));
        let request = TaskRequest::new(NoBody {})
            .with_resource_links(["/r/a"])
            .with_correlation_id("ctx-9");

        let (stage, deleted) = run_cleanup_request(resources, request).await;
        assert_eq!(stage, TaskStage::Finished);
        assert_eq!(
            deleted,
            vec!["/r/a", "/r/a/1", "/r/a/1/x", "/r/b", "/r/b/1", "/r/orphan"]
        );
    }

    #[tokio::test]
    async fn test_empty_link_set_completes_without_deletes() {
        let (stage, deleted) = run_cleanup(tree(), &[]).await;
        assert_eq!(stage, TaskStage::Finished);
        assert!(deleted.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_fails_the_task() {
        let mut resources = tree();
        resources.fail_on = Some("/r/a/1".to_string());
        let (stage, deleted) = run_cleanup(resources, &["/r/a"]).await;
        assert_eq!(stage, TaskStage::Failed);
        assert!(!deleted.contains(&"/r/a/1".to_string()));
    }
}
