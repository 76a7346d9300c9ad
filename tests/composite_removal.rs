//! Composite removal: ordered deletes and cleanup-only compensation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use armada::adapter::{AdapterOperation, ScriptedAdapter};
use armada::config::ControlPlaneConfig;
use armada::control_plane::ControlPlane;
use armada::registry::{ResourceRegistry, ResourceState, ResourceType};
use armada::workflows::removal::RemovalBody;
use armada::workflows::{Adapters, CompositeRemoval};
use armada_tasks::domain::{TaskHeader, TaskRequest};
use armada_tasks::retry::RetryPolicy;
use armada_tasks::{FailureKind, TaskStage};
use pretty_assertions::assert_eq;

fn composite(registry: &ResourceRegistry, id: &str, children: &[(ResourceType, &str)]) -> String {
    let composite = ResourceState::new(ResourceType::CompositeComponent, id, id);
    let link = composite.link.clone();
    registry.insert(composite).unwrap();
    for (resource_type, child) in children {
        registry
            .insert(ResourceState::new(*resource_type, child, *child).with_parent(&link))
            .unwrap();
    }
    link
}

async fn plane_with(
    config: ControlPlaneConfig,
    registry: Arc<ResourceRegistry>,
) -> (ControlPlane, Arc<ScriptedAdapter>) {
    let adapter = Arc::new(ScriptedAdapter::new("backend"));
    let plane = ControlPlane::with_registry(config, Adapters::uniform(adapter.clone()), registry)
        .await
        .unwrap();
    (plane, adapter)
}

async fn remove(plane: &ControlPlane, body: RemovalBody, links: BTreeSet<String>) -> TaskHeader {
    remove_request(plane, TaskRequest::new(body).with_resource_links(links)).await
}

async fn remove_request(plane: &ControlPlane, request: TaskRequest<RemovalBody>) -> TaskHeader {
    let address = plane.engine().start::<CompositeRemoval>(request).await.unwrap();
    plane
        .engine()
        .await_terminal(&address, Duration::from_secs(5))
        .await
        .unwrap()
}

fn deletes(adapter: &ScriptedAdapter) -> Vec<String> {
    adapter
        .calls()
        .into_iter()
        .filter(|r| r.operation == AdapterOperation::Delete)
        .map(|r| r.resource_reference)
        .collect()
}

mod ordered_removal_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn resource_types_are_deleted_in_order() {
        let registry = Arc::new(ResourceRegistry::new());
        let shop = composite(
            &registry,
            "shop",
            &[
                (ResourceType::Volume, "data"),
                (ResourceType::Network, "net"),
                (ResourceType::Compute, "vm"),
                (ResourceType::Container, "web"),
                (ResourceType::Container, "db"),
            ],
        );
        let (plane, adapter) = plane_with(ControlPlaneConfig::default(), Arc::clone(&registry)).await;

        let header = remove(&plane, RemovalBody::default(), [shop.clone()].into()).await;
        assert_eq!(header.stage, TaskStage::Finished);

        let order = deletes(&adapter);
        assert_eq!(order.len(), 5);
        let mut containers: Vec<&str> = order[..2].iter().map(String::as_str).collect();
        containers.sort_unstable();
        assert_eq!(
            containers,
            vec!["/resources/containers/db", "/resources/containers/web"]
        );
        assert_eq!(
            order[2..].to_vec(),
            vec![
                ResourceType::Compute.link("vm"),
                ResourceType::Network.link("net"),
                ResourceType::Volume.link("data"),
            ]
        );
        assert!(registry.is_empty(), "left behind: {:?}", registry.links());
    }

    #[tokio::test]
    async fn unknown_type_fails_before_any_delete() {
        let registry = Arc::new(ResourceRegistry::new());
        let shop = composite(
            &registry,
            "shop",
            &[(ResourceType::Container, "web"), (ResourceType::Volume, "data")],
        );
        let mut config = ControlPlaneConfig::default();
        config.workflows.removal_order = vec![ResourceType::Container];
        let (plane, adapter) = plane_with(config, Arc::clone(&registry)).await;

        let header = remove(&plane, RemovalBody::default(), [shop.clone()].into()).await;

        assert_eq!(header.stage, TaskStage::Failed);
        let failure = header.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Validation);
        assert_eq!(failure.message, "Unknown order of removal for resource types: VOLUME");
        assert!(deletes(&adapter).is_empty());
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn failed_delete_keeps_the_composite() {
        let registry = Arc::new(ResourceRegistry::new());
        let shop = composite(&registry, "shop", &[(ResourceType::Container, "web")]);
        let mut config = ControlPlaneConfig::default();
        config.engine.retry = RetryPolicy::new(2, Duration::ZERO);
        let (plane, adapter) = plane_with(config, Arc::clone(&registry)).await;
        let web = ResourceType::Container.link("web");
        adapter.fail_always(AdapterOperation::Delete, &web, ScriptedAdapter::unavailable(&web));

        let header = remove(&plane, RemovalBody::default(), [shop.clone()].into()).await;

        assert_eq!(header.stage, TaskStage::Failed);
        assert_eq!(header.failure.unwrap().kind, FailureKind::RetryExhausted);
        assert_eq!(deletes(&adapter).len(), 2);
        assert!(registry.contains(&shop));
        assert!(registry.contains(&web));
    }

    #[tokio::test]
    async fn first_failed_delete_fails_the_task_at_once() {
        let registry = Arc::new(ResourceRegistry::new());
        let shop = composite(
            &registry,
            "shop",
            &[(ResourceType::Container, "a"), (ResourceType::Container, "b")],
        );
        let mut config = ControlPlaneConfig::default();
        config.engine.retry = RetryPolicy::new(3, Duration::from_millis(300));
        let (plane, adapter) = plane_with(config, Arc::clone(&registry)).await;
        let a = ResourceType::Container.link("a");
        let b = ResourceType::Container.link("b");
        adapter.fail_always(AdapterOperation::Delete, &a, ScriptedAdapter::unavailable(&a));
        adapter.fail_always(AdapterOperation::Delete, &b, ScriptedAdapter::rejected(&b, 400));

        let started = Instant::now();
        let header = remove(&plane, RemovalBody::default(), [shop.clone()].into()).await;
        let elapsed = started.elapsed();

        assert_eq!(header.stage, TaskStage::Failed);
        let failure = header.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Remote);
        assert_eq!(failure.status_code, Some(400));
        assert!(failure.message.contains(&b), "{}", failure.message);
        assert!(elapsed < Duration::from_millis(300), "failed after {elapsed:?}");
        assert!(registry.contains(&shop));
    }

    #[tokio::test]
    async fn composite_without_resources_is_removed() {
        let registry = Arc::new(ResourceRegistry::new());
        let empty = composite(&registry, "empty", &[]);
        let (plane, adapter) = plane_with(ControlPlaneConfig::default(), Arc::clone(&registry)).await;

        let header = remove(&plane, RemovalBody::default(), [empty].into()).await;

        assert_eq!(header.stage, TaskStage::Finished);
        assert!(deletes(&adapter).is_empty());
        assert!(registry.is_empty());
    }
}

mod cleanup_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cleanup_only() -> RemovalBody {
        RemovalBody {
            cleanup_only: Some(true),
            ..RemovalBody::default()
        }
    }

    #[tokio::test]
    async fn cleanup_removes_exactly_the_descendants() {
        let registry = Arc::new(ResourceRegistry::new());
        let a = composite(&registry, "a", &[(ResourceType::Container, "a-web")]);
        let b = composite(
            &registry,
            "b",
            &[(ResourceType::Network, "b-net"), (ResourceType::Volume, "b-data")],
        );
        let c = composite(&registry, "c", &[]);
        // Grandchild of b through its network.
        registry
            .insert(
                ResourceState::new(ResourceType::Container, "b-proxy", "b-proxy")
                    .with_parent(ResourceType::Network.link("b-net")),
            )
            .unwrap();
        let bystander = composite(&registry, "other", &[(ResourceType::Container, "other-web")]);
        let (plane, adapter) = plane_with(ControlPlaneConfig::default(), Arc::clone(&registry)).await;

        let header = remove(&plane, cleanup_only(), [a, b, c].into()).await;

        assert_eq!(header.stage, TaskStage::Finished);
        assert!(adapter.calls().is_empty());
        let left: BTreeSet<String> = [bystander, ResourceType::Container.link("other-web")].into();
        assert_eq!(registry.links(), left);
    }

    #[tokio::test]
    async fn cleanup_follows_the_correlation_id() {
        let registry = Arc::new(ResourceRegistry::new());
        let a = composite(&registry, "a", &[(ResourceType::Container, "a-web")]);
        // Created for the same request but never attached to the composite.
        registry
            .insert(
                ResourceState::new(ResourceType::Volume, "a-scratch", "a-scratch")
                    .with_correlation_id("shop-ctx"),
            )
            .unwrap();
        let bystander = composite(&registry, "other", &[]);
        let (plane, adapter) = plane_with(ControlPlaneConfig::default(), Arc::clone(&registry)).await;

        let header = remove_request(
            &plane,
            TaskRequest::new(cleanup_only())
                .with_resource_links([a])
                .with_correlation_id("shop-ctx"),
        )
        .await;

        assert_eq!(header.stage, TaskStage::Finished);
        assert!(adapter.calls().is_empty());
        assert_eq!(registry.links(), BTreeSet::from([bystander]));
    }

    #[tokio::test]
    async fn empty_removal_completes_without_work() {
        let registry = Arc::new(ResourceRegistry::new());
        let kept = composite(&registry, "kept", &[(ResourceType::Container, "kept-web")]);
        let (plane, adapter) = plane_with(ControlPlaneConfig::default(), Arc::clone(&registry)).await;

        for body in [cleanup_only(), RemovalBody::default()] {
            let header = remove(&plane, body, BTreeSet::new()).await;
            assert_eq!(header.stage, TaskStage::Finished);
        }
        assert!(adapter.calls().is_empty());
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&kept));
    }
}
