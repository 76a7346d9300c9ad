//! Container-host provisioning against scripted adapters.

use std::sync::Arc;
use std::time::Duration;

use armada::adapter::{AdapterOperation, ScriptedAdapter};
use armada::config::ControlPlaneConfig;
use armada::constants::{CONTAINER_HOST_REGISTERED_KEY, ENABLE_CONTAINER_HOST_KEY};
use armada::control_plane::ControlPlane;
use armada::registry::{ResourceState, ResourceType};
use armada::workflows::container_hosts::{ContainerHostBody, HostDescription};
use armada::workflows::{Adapters, ContainerHostProvisioning};
use armada_tasks::counter::{CounterBody, CounterWorkflow};
use armada_tasks::domain::TaskRequest;
use armada_tasks::engine::Workflow;
use armada_tasks::retry::RetryPolicy;
use armada_tasks::{FailureKind, TaskAddress, TaskError, TaskStage};
use pretty_assertions::assert_eq;

fn fast_config() -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.engine.retry = RetryPolicy::new(3, Duration::ZERO);
    config.workflows.host_connection_retry = RetryPolicy::new(2, Duration::from_millis(5));
    config
}

fn inline_request(id: &str, count: u64) -> TaskRequest<ContainerHostBody> {
    TaskRequest::new(ContainerHostBody {
        host_description: Some(HostDescription {
            name: "docker-host".to_string(),
            ..HostDescription::default()
        }),
        endpoint_link: Some("/endpoints/lab".to_string()),
        ..ContainerHostBody::default()
    })
    .with_id(id)
    .with_resource_count(count)
}

mod provisioning_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ─── Happy path ───

    #[tokio::test]
    async fn three_hosts_are_created_and_registered() {
        let compute = Arc::new(ScriptedAdapter::new("vsphere"));
        let plane = ControlPlane::from_config(
            fast_config(),
            Adapters {
                compute: compute.clone(),
                ..Adapters::scripted()
            },
        )
        .await
        .unwrap();

        let address = plane
            .engine()
            .start::<ContainerHostProvisioning>(inline_request("hosts", 3))
            .await
            .unwrap();
        let header = plane
            .engine()
            .await_terminal(&address, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(header.stage, TaskStage::Finished);

        let task = plane.engine().get::<ContainerHostProvisioning>(&address).await.unwrap();
        let expected: Vec<String> = (1..=3).map(|i| ResourceType::Compute.link(&format!("hosts-{i}"))).collect();
        assert_eq!(task.resource_links.iter().cloned().collect::<Vec<_>>(), expected);
        for link in &expected {
            let host = plane.registry().get(link).unwrap();
            assert_eq!(host.property(ENABLE_CONTAINER_HOST_KEY), Some("true"));
            assert_eq!(host.property(CONTAINER_HOST_REGISTERED_KEY), Some("true"));
            assert_eq!(host.correlation_id.as_deref(), Some("hosts"));
        }
        assert_eq!(compute.call_count(AdapterOperation::Create), 3);
        assert_eq!(compute.call_count(AdapterOperation::Validate), 3);
    }

    #[tokio::test]
    async fn counters_do_not_collide_with_foreign_task_ids() {
        let plane = ControlPlane::from_config(fast_config(), Adapters::scripted())
            .await
            .unwrap();
        let engine = plane.engine();
        let foreign = engine
            .start::<CounterWorkflow>(TaskRequest::new(CounterBody::expecting(0)).with_id("shared"))
            .await
            .unwrap();
        engine.await_terminal(&foreign, Duration::from_secs(5)).await.unwrap();

        let address = engine
            .start::<ContainerHostProvisioning>(inline_request("shared", 2))
            .await
            .unwrap();
        let header = engine.await_terminal(&address, Duration::from_secs(5)).await.unwrap();
        assert_eq!(header.stage, TaskStage::Finished);

        let counter = TaskAddress::new(CounterWorkflow::KIND, "compute-provision:shared");
        assert_eq!(engine.header(&counter).await.unwrap().stage, TaskStage::Finished);
    }

    #[tokio::test]
    async fn existing_description_is_flagged_as_container_host() {
        let plane = ControlPlane::from_config(fast_config(), Adapters::scripted())
            .await
            .unwrap();
        let description = ResourceState::new(ResourceType::ComputeDescription, "small", "small");
        let description_link = description.link.clone();
        plane.registry().insert(description).unwrap();

        let request = TaskRequest::new(ContainerHostBody {
            compute_description_link: Some(description_link.clone()),
            endpoint_link: Some("/endpoints/lab".to_string()),
            ..ContainerHostBody::default()
        })
        .with_resource_count(1);
        let address = plane
            .engine()
            .start::<ContainerHostProvisioning>(request)
            .await
            .unwrap();
        let header = plane
            .engine()
            .await_terminal(&address, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(header.stage, TaskStage::Finished);
        assert_eq!(header.resource_links.len(), 1);
        let description = plane.registry().get(&description_link).unwrap();
        assert_eq!(description.property(ENABLE_CONTAINER_HOST_KEY), Some("true"));
    }

    #[tokio::test]
    async fn transient_create_failures_are_retried() {
        let compute = Arc::new(ScriptedAdapter::new("vsphere"));
        let flaky = ResourceType::Compute.link("flaky-1");
        compute.fail_times(AdapterOperation::Create, &flaky, 2, ScriptedAdapter::unavailable(&flaky));
        let plane = ControlPlane::from_config(
            fast_config(),
            Adapters {
                compute: compute.clone(),
                ..Adapters::scripted()
            },
        )
        .await
        .unwrap();

        let address = plane
            .engine()
            .start::<ContainerHostProvisioning>(inline_request("flaky", 1))
            .await
            .unwrap();
        let header = plane
            .engine()
            .await_terminal(&address, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(header.stage, TaskStage::Finished);
        assert_eq!(
            compute.calls_by_reference().get(&(AdapterOperation::Create, flaky)),
            Some(&3)
        );
    }

    // ─── Failures ───

    #[tokio::test]
    async fn unreachable_host_exhausts_the_connection_budget() {
        let compute = Arc::new(ScriptedAdapter::new("vsphere"));
        let host = ResourceType::Compute.link("dead-1");
        compute.fail_always(AdapterOperation::Validate, &host, ScriptedAdapter::unavailable(&host));
        let plane = ControlPlane::from_config(
            fast_config(),
            Adapters {
                compute: compute.clone(),
                ..Adapters::scripted()
            },
        )
        .await
        .unwrap();

        let address = plane
            .engine()
            .start::<ContainerHostProvisioning>(inline_request("dead", 1))
            .await
            .unwrap();
        let header = plane
            .engine()
            .await_terminal(&address, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(header.stage, TaskStage::Failed);
        let failure = header.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::RetryExhausted);
        assert!(
            failure.message.starts_with(&format!("Failed registering container host {host}")),
            "unexpected message: {}",
            failure.message
        );
        assert_eq!(compute.call_count(AdapterOperation::Validate), 2);
        let registered = plane.registry().get(&host).unwrap();
        assert_eq!(registered.property(CONTAINER_HOST_REGISTERED_KEY), None);
    }

    #[tokio::test]
    async fn request_without_description_is_refused() {
        let plane = ControlPlane::from_config(fast_config(), Adapters::scripted())
            .await
            .unwrap();
        let request = TaskRequest::new(ContainerHostBody {
            endpoint_link: Some("/endpoints/lab".to_string()),
            ..ContainerHostBody::default()
        })
        .with_resource_count(1);

        let err = plane
            .engine()
            .start::<ContainerHostProvisioning>(request)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TaskError::Validation { ref message, .. } if message == "'computeDescriptionLink' or 'hostDescription' must be set")
        );
        assert!(plane.engine().store().list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_hosts_are_refused() {
        let plane = ControlPlane::from_config(fast_config(), Adapters::scripted())
            .await
            .unwrap();
        let err = plane
            .engine()
            .start::<ContainerHostProvisioning>(inline_request("none", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation { .. }));
    }
}
