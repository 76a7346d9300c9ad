//! Restart recovery and cleanup
//!
//! Starts container-host provisioning on a file-backed store while the
//! compute backend hangs, then abandons that control plane mid-flight. A
//! second control plane opened on the same directory resumes the stored
//! tasks and finishes them. Finally every resource correlated with the
//! request is dropped from the registry by a cleanup-only removal.
//!
//! Run with:
//! ```bash
//! cargo run --example d03_cleanup_and_restart
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use armada::adapter::{AdapterOperation, ScriptedAdapter};
use armada::config::{BackendKind, ControlPlaneConfig};
use armada::control_plane::ControlPlane;
use armada::registry::ResourceRegistry;
use armada::workflows::container_hosts::{ContainerHostBody, HostDescription};
use armada::workflows::removal::RemovalBody;
use armada::workflows::{Adapters, CompositeRemoval, ContainerHostProvisioning};
use armada_tasks::domain::TaskRequest;
use armada_tasks::{TaskAddress, TaskStage};

const REQUEST_ID: &str = "restart";

fn file_config(dir: &std::path::Path) -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.store.backend = BackendKind::File;
    config.store.path = Some(dir.to_path_buf());
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = file_config(dir.path());
    armada::init_logging(&config.log_filter)?;

    // The registry outlives both control planes.
    let registry = Arc::new(ResourceRegistry::new());

    // ─── First run: the compute backend never answers ───
    let stuck = Arc::new(ScriptedAdapter::new("vsphere").with_latency(Duration::from_secs(3600)));
    let first = ControlPlane::with_registry(
        config.clone(),
        Adapters {
            compute: stuck.clone(),
            ..Adapters::scripted()
        },
        Arc::clone(&registry),
    )
    .await?;

    let mut events = first.engine().subscribe();
    let body = ContainerHostBody {
        host_description: Some(HostDescription {
            name: "edge-host".to_string(),
            ..HostDescription::default()
        }),
        endpoint_link: Some("/endpoints/edge".to_string()),
        ..ContainerHostBody::default()
    };
    let address = first
        .engine()
        .start::<ContainerHostProvisioning>(TaskRequest::new(body).with_id(REQUEST_ID).with_resource_count(2))
        .await?;

    let mut waiting = 0;
    while waiting < 2 {
        let event = events.recv().await?;
        if event.workflow == "compute-instance-provision" && event.sub_stage == "CREATING_HOST" {
            waiting += 1;
        }
    }
    let header = first.engine().header(&address).await?;
    println!(
        "first run stalled: {} is {}({}), {} CREATE calls pending",
        address,
        header.stage,
        header.sub_stage,
        stuck.call_count(AdapterOperation::Create)
    );
    drop(first);

    // ─── Second run: same store, working backend ───
    let second = ControlPlane::with_registry(config, Adapters::scripted(), Arc::clone(&registry)).await?;
    let resumed = second.recover().await?;
    println!("second run resumed {resumed} tasks");

    let header = second
        .engine()
        .await_terminal(&address, Duration::from_secs(10))
        .await
        .context("provisioning did not finish after the restart")?;
    anyhow::ensure!(header.stage == TaskStage::Finished, "provisioning ended {}", header.stage);
    let task = second.engine().get::<ContainerHostProvisioning>(&address).await?;
    println!("{} finished with {:?}", address, task.resource_links);

    // ─── Cleanup ───
    let correlated = registry.correlated(REQUEST_ID, None);
    println!("removing {} correlated records", correlated.len());
    let removal = second
        .engine()
        .start::<CompositeRemoval>(
            TaskRequest::new(RemovalBody {
                cleanup_only: Some(true),
                ..RemovalBody::default()
            })
            .with_resource_links(correlated)
            .with_correlation_id(REQUEST_ID),
        )
        .await?;
    let header = second.engine().await_terminal(&removal, Duration::from_secs(10)).await?;
    println!(
        "{} ended {}, {} records left",
        removal,
        header.stage,
        registry.len()
    );

    let leftover: Vec<TaskAddress> = second
        .engine()
        .store()
        .list_all()
        .await?
        .into_iter()
        .filter(|h| !h.is_terminal())
        .map(|h| h.address)
        .collect();
    anyhow::ensure!(leftover.is_empty(), "tasks still running: {leftover:?}");
    Ok(())
}
