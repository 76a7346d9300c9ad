//! Kubernetes composite provisioning and removal
//!
//! Seeds the registry with a group placement, two registered container
//! hosts and a composite component, then:
//!
//! 1. provisions the composite (reservation, host selection, APPLY)
//! 2. removes it again, deleting the component resources in type order
//!
//! Run with:
//! ```bash
//! cargo run --example d02_kubernetes_composite
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use armada::adapter::{AdapterOperation, ScriptedAdapter};
use armada::config::ControlPlaneConfig;
use armada::constants::{
    AVAILABLE_INSTANCES_KEY, CONTAINER_HOST_REGISTERED_KEY, HOST_LINK_KEY, RESOURCE_POOL_LINK_KEY,
};
use armada::control_plane::ControlPlane;
use armada::registry::{ResourceRegistry, ResourceState, ResourceType};
use armada::workflows::kubernetes::KubernetesBody;
use armada::workflows::removal::RemovalBody;
use armada::workflows::{Adapters, CompositeRemoval, KubernetesCompositeProvisioning};
use armada_tasks::domain::TaskRequest;
use armada_tasks::TaskStage;

const POOL: &str = "/resource-pools/lab";

fn seed(registry: &ResourceRegistry) -> anyhow::Result<String> {
    registry.insert(
        ResourceState::new(ResourceType::GroupPlacement, "lab", "lab placement")
            .with_custom_property(RESOURCE_POOL_LINK_KEY, POOL)
            .with_custom_property(AVAILABLE_INSTANCES_KEY, "10"),
    )?;
    for host in ["host-a", "host-b"] {
        registry.insert(
            ResourceState::new(ResourceType::Compute, host, host)
                .with_custom_property(RESOURCE_POOL_LINK_KEY, POOL)
                .with_custom_property(CONTAINER_HOST_REGISTERED_KEY, "true"),
        )?;
    }

    let composite = ResourceState::new(ResourceType::CompositeComponent, "shop", "shop");
    let composite_link = composite.link.clone();
    registry.insert(composite)?;
    for (resource_type, id) in [
        (ResourceType::Volume, "shop-data"),
        (ResourceType::Network, "shop-net"),
        (ResourceType::Container, "shop-web"),
        (ResourceType::Container, "shop-db"),
    ] {
        registry.insert(ResourceState::new(resource_type, id, id).with_parent(&composite_link))?;
    }
    Ok(composite_link)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControlPlaneConfig::default();
    armada::init_logging(&config.log_filter)?;

    let containers = Arc::new(ScriptedAdapter::new("docker"));
    let adapters = Adapters {
        containers: containers.clone(),
        ..Adapters::scripted()
    };
    let registry = Arc::new(ResourceRegistry::new());
    let composite_link = seed(&registry)?;
    let plane = ControlPlane::with_registry(config, adapters, registry).await?;
    let engine = plane.engine();

    println!("1. Provisioning {composite_link}");
    let body = KubernetesBody {
        composite_component_link: Some(composite_link.clone()),
        ..KubernetesBody::default()
    };
    let address = engine
        .start::<KubernetesCompositeProvisioning>(
            TaskRequest::new(body).with_resource_description_link("/composite-descriptions/shop"),
        )
        .await?;
    let header = engine
        .await_terminal(&address, Duration::from_secs(10))
        .await
        .context("provisioning did not finish")?;
    let task = engine.get::<KubernetesCompositeProvisioning>(&address).await?;
    println!("   {} ended {}", address, header.stage);
    println!("   descriptor: {}", task.body.desc_name.as_deref().unwrap_or("-"));
    println!("   placement:  {}", task.body.group_placement_link.as_deref().unwrap_or("-"));
    let component = plane.registry().get(&composite_link)?;
    println!("   host:       {}", component.property(HOST_LINK_KEY).unwrap_or("-"));
    anyhow::ensure!(header.stage == TaskStage::Finished, "provisioning failed: {:?}", task.failure);

    println!("\n2. Removing {composite_link}");
    let address = engine
        .start::<CompositeRemoval>(
            TaskRequest::new(RemovalBody::default()).with_resource_links([composite_link.clone()]),
        )
        .await?;
    let header = engine
        .await_terminal(&address, Duration::from_secs(10))
        .await
        .context("removal did not finish")?;
    println!("   {} ended {}", address, header.stage);
    for request in containers.calls() {
        if request.operation == AdapterOperation::Delete {
            println!("   DELETE {}", request.resource_reference);
        }
    }
    println!("   composite still registered: {}", plane.registry().contains(&composite_link));
    Ok(())
}
