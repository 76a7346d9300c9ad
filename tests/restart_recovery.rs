//! Tasks stored by one control plane are finished by the next.

use std::sync::Arc;
use std::time::Duration;

use armada::adapter::{AdapterOperation, ScriptedAdapter};
use armada::config::{BackendKind, ControlPlaneConfig};
use armada::control_plane::ControlPlane;
use armada::registry::{ResourceRegistry, ResourceState, ResourceType};
use armada::workflows::container_hosts::{ContainerHostBody, HostDescription};
use armada::workflows::removal::RemovalBody;
use armada::workflows::{Adapters, CompositeRemoval, ContainerHostProvisioning};
use armada_tasks::domain::TaskRequest;
use armada_tasks::{FailureKind, TaskStage};
use pretty_assertions::assert_eq;

fn file_config(dir: &std::path::Path) -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.store.backend = BackendKind::File;
    config.store.path = Some(dir.to_path_buf());
    config
}

fn hosts(count: u64) -> TaskRequest<ContainerHostBody> {
    TaskRequest::new(ContainerHostBody {
        host_description: Some(HostDescription {
            name: "host".to_string(),
            ..HostDescription::default()
        }),
        endpoint_link: Some("/endpoints/lab".to_string()),
        ..ContainerHostBody::default()
    })
    .with_id("recovered")
    .with_resource_count(count)
}

mod recovery_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn stalled_provisioning_finishes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ResourceRegistry::new());

        let hanging = Arc::new(ScriptedAdapter::new("vsphere").with_latency(Duration::from_secs(3600)));
        let first = ControlPlane::with_registry(
            file_config(dir.path()),
            Adapters {
                compute: hanging.clone(),
                ..Adapters::scripted()
            },
            Arc::clone(&registry),
        )
        .await
        .unwrap();
        let mut events = first.engine().subscribe();
        let address = first
            .engine()
            .start::<ContainerHostProvisioning>(hosts(2))
            .await
            .unwrap();
        let mut creating = 0;
        while creating < 2 {
            let event = events.recv().await.unwrap();
            if event.workflow == "compute-instance-provision" && event.sub_stage == "CREATING_HOST" {
                creating += 1;
            }
        }
        drop(first);

        let compute = Arc::new(ScriptedAdapter::new("vsphere"));
        let second = ControlPlane::with_registry(
            file_config(dir.path()),
            Adapters {
                compute: compute.clone(),
                ..Adapters::scripted()
            },
            Arc::clone(&registry),
        )
        .await
        .unwrap();
        assert!(second.recover().await.unwrap() > 0);

        let header = second
            .engine()
            .await_terminal(&address, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(header.stage, TaskStage::Finished, "failure: {:?}", header.failure);
        assert_eq!(header.resource_links.len(), 2);
        assert_eq!(compute.call_count(AdapterOperation::Create), 2);
        assert_eq!(compute.call_count(AdapterOperation::Validate), 2);
    }

    #[tokio::test]
    async fn finished_tasks_are_not_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let first = ControlPlane::from_config(file_config(dir.path()), Adapters::scripted())
            .await
            .unwrap();
        let address = first
            .engine()
            .start::<CompositeRemoval>(TaskRequest::new(RemovalBody::default()))
            .await
            .unwrap();
        first
            .engine()
            .await_terminal(&address, Duration::from_secs(5))
            .await
            .unwrap();
        drop(first);

        let second = ControlPlane::from_config(file_config(dir.path()), Adapters::scripted())
            .await
            .unwrap();
        assert_eq!(second.recover().await.unwrap(), 0);
        let header = second.engine().header(&address).await.unwrap();
        assert_eq!(header.stage, TaskStage::Finished);
    }

    #[tokio::test]
    async fn overdue_tasks_expire_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ResourceRegistry::new());
        let composite = ResourceState::new(ResourceType::CompositeComponent, "slow", "slow");
        let composite_link = composite.link.clone();
        registry.insert(composite).unwrap();
        registry
            .insert(ResourceState::new(ResourceType::Container, "slow-web", "slow-web").with_parent(&composite_link))
            .unwrap();

        let mut config = file_config(dir.path());
        config.engine.default_task_ttl_ms = Some(50);
        let hanging = Arc::new(ScriptedAdapter::new("docker").with_latency(Duration::from_secs(3600)));
        let first = ControlPlane::with_registry(
            config.clone(),
            Adapters::uniform(hanging),
            Arc::clone(&registry),
        )
        .await
        .unwrap();
        let address = first
            .engine()
            .start::<CompositeRemoval>(
                TaskRequest::new(RemovalBody::default()).with_resource_links([composite_link.clone()]),
            )
            .await
            .unwrap();
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = ControlPlane::with_registry(config, Adapters::scripted(), Arc::clone(&registry))
            .await
            .unwrap();
        second.recover().await.unwrap();
        let header = second.engine().header(&address).await.unwrap();
        assert_eq!(header.stage, TaskStage::Failed);
        assert_eq!(header.failure.unwrap().kind, FailureKind::Expired);
        assert!(registry.contains(&composite_link));
    }
}
