//! Container-host provisioning end to end
//!
//! Provisions three container hosts from an inline compute description.
//! The compute adapter refuses the first CREATE for one host, which the
//! retry policy absorbs, and the progress events of every task are printed
//! as they arrive.
//!
//! Run with:
//! ```bash
//! RUST_LOG=armada=debug cargo run --example d01_container_hosts
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use armada::adapter::{AdapterOperation, ScriptedAdapter};
use armada::config::ControlPlaneConfig;
use armada::control_plane::ControlPlane;
use armada::workflows::container_hosts::{ContainerHostBody, HostDescription};
use armada::workflows::{Adapters, ContainerHostProvisioning};
use armada_tasks::domain::TaskRequest;
use armada_tasks::retry::RetryPolicy;
use armada_tasks::TaskStage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = ControlPlaneConfig::default();
    config.engine.retry = RetryPolicy::new(3, Duration::from_millis(200));
    config.workflows.host_connection_retry = RetryPolicy::new(5, Duration::from_millis(100));
    armada::init_logging(&config.log_filter)?;

    let compute = Arc::new(ScriptedAdapter::new("vsphere").with_latency(Duration::from_millis(50)));
    let adapters = Adapters {
        compute: compute.clone(),
        ..Adapters::scripted()
    };
    let plane = ControlPlane::from_config(config, adapters).await?;

    let mut events = plane.engine().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!(
                "  {:<45} {:>9}({}) {:>3}%",
                event.address, event.stage, event.sub_stage, event.progress
            );
        }
    });

    let body = ContainerHostBody {
        host_description: Some(HostDescription {
            name: "docker-host".to_string(),
            instance_type: Some("medium".to_string()),
            ..HostDescription::default()
        }),
        endpoint_link: Some("/endpoints/vsphere-lab".to_string()),
        ..ContainerHostBody::default()
    };
    let request = TaskRequest::new(body)
        .with_id("demo")
        .with_resource_count(3)
        .with_tenant_link("/tenants/qe");

    // The second compute fails once before it is created.
    compute.fail_times(
        AdapterOperation::Create,
        "/resources/compute/demo-2",
        1,
        ScriptedAdapter::unavailable("/resources/compute/demo-2"),
    );

    println!("Provisioning 3 container hosts");
    let address = plane.engine().start::<ContainerHostProvisioning>(request).await?;
    let header = plane
        .engine()
        .await_terminal(&address, Duration::from_secs(30))
        .await
        .context("provisioning did not finish")?;

    let task = plane.engine().get::<ContainerHostProvisioning>(&address).await?;
    println!("\n{} ended {}", address, header.stage);
    for link in &task.resource_links {
        let host = plane.registry().get(link)?;
        println!("  {} name={} properties={:?}", link, host.name, host.custom_properties);
    }
    println!(
        "compute adapter: {} CREATE, {} VALIDATE",
        compute.call_count(AdapterOperation::Create),
        compute.call_count(AdapterOperation::Validate)
    );
    anyhow::ensure!(header.stage == TaskStage::Finished, "provisioning failed: {:?}", task.failure);
    Ok(())
}
