//! Concrete provisioning and removal workflows.
//!
//! Each workflow is a table of sub-stage handlers on top of
//! [`armada_tasks::engine::Workflow`]. Helpers are separate workflows
//! composed through task links:
//!
//! ```text
//! container-host-provisioning
//!   ├── compute-allocation
//!   └── compute-provision
//!         ├── counter
//!         └── compute-instance-provision  (one per compute)
//!
//! kubernetes-composite-provisioning
//!   ├── reservation
//!   └── placement-host-selection
//!
//! composite-removal
//! artifact-pipeline
//! ```
//!
//! Remote systems are reached only through the [`Adapter`] handles in
//! [`Services`]; local state lives in the [`ResourceRegistry`].

pub mod artifact;
pub mod compute_allocation;
pub mod compute_provision;
pub mod container_hosts;
pub mod kubernetes;
pub mod placement;
pub mod removal;

use std::fmt;
use std::sync::Arc;

use armada_tasks::counter::CounterWorkflow;
use armada_tasks::engine::TaskEngine;

use crate::adapter::{Adapter, ScriptedAdapter};
use crate::config::WorkflowSettings;
use crate::registry::{ResourceRegistry, ResourceType};

pub use artifact::ArtifactPipeline;
pub use compute_allocation::ComputeAllocation;
pub use compute_provision::{ComputeInstanceProvisioning, ComputeProvision};
pub use container_hosts::ContainerHostProvisioning;
pub use kubernetes::KubernetesCompositeProvisioning;
pub use placement::{HostSelection, PlacementHostSelection, Reservation};
pub use removal::CompositeRemoval;

/// Adapter handles, one per backend family.
#[derive(Clone)]
pub struct Adapters {
    /// Creates, validates and deletes compute hosts.
    pub compute: Arc<dyn Adapter>,
    /// Deletes containers, networks and volumes.
    pub containers: Arc<dyn Adapter>,
    /// Applies Kubernetes composite applications.
    pub kubernetes: Arc<dyn Adapter>,
    /// Resolves sources, compiles and publishes artifacts.
    pub artifacts: Arc<dyn Adapter>,
}

impl Adapters {
    /// The same adapter for every backend.
    pub fn uniform(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            compute: Arc::clone(&adapter),
            containers: Arc::clone(&adapter),
            kubernetes: Arc::clone(&adapter),
            artifacts: adapter,
        }
    }

    /// Scripted adapters that accept every request.
    pub fn scripted() -> Self {
        Self {
            compute: Arc::new(ScriptedAdapter::new("compute")),
            containers: Arc::new(ScriptedAdapter::new("docker")),
            kubernetes: Arc::new(ScriptedAdapter::new("kubernetes")),
            artifacts: Arc::new(ScriptedAdapter::new("artifacts")),
        }
    }

    /// Adapter that removes resources of `resource_type`.
    pub fn for_removal(&self, resource_type: ResourceType) -> &Arc<dyn Adapter> {
        match resource_type {
            ResourceType::Compute => &self.compute,
            _ => &self.containers,
        }
    }
}

impl fmt::Debug for Adapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapters")
            .field("compute", &self.compute.name())
            .field("containers", &self.containers.name())
            .field("kubernetes", &self.kubernetes.name())
            .field("artifacts", &self.artifacts.name())
            .finish()
    }
}

/// Everything a workflow needs besides the engine.
#[derive(Debug, Clone)]
pub struct Services {
    pub registry: Arc<ResourceRegistry>,
    pub adapters: Adapters,
    pub settings: WorkflowSettings,
}

impl Services {
    pub fn new(registry: Arc<ResourceRegistry>, adapters: Adapters) -> Self {
        Self {
            registry,
            adapters,
            settings: WorkflowSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Registers every workflow of this crate, and the counter they use for
/// durable fan-in, with `engine`.
pub fn register_all(engine: &TaskEngine, services: &Services) {
    engine.register(CounterWorkflow);
    engine.register(ContainerHostProvisioning::new(services.clone()));
    engine.register(ComputeAllocation::new(services.clone()));
    engine.register(ComputeProvision::new(services.clone()));
    engine.register(ComputeInstanceProvisioning::new(services.clone()));
    engine.register(KubernetesCompositeProvisioning::new(services.clone()));
    engine.register(Reservation::new(services.clone()));
    engine.register(PlacementHostSelection::new(services.clone()));
    engine.register(CompositeRemoval::new(services.clone()));
    engine.register(ArtifactPipeline::new(services.clone()));
}

/// Correlation id for a task: the one it carries, else its own id.
pub(crate) fn context_id_of<S, B>(task: &armada_tasks::domain::TaskRecord<S, B>) -> String
where
    S: armada_tasks::SubStage,
    B: armada_tasks::domain::TaskBody,
{
    task.context_id()
        .map_or_else(|| task.address.id().to_string(), str::to_string)
}
