//! Container-host provisioning.
//!
//! ```text
//! CREATED ─► DESCRIPTION_CREATED ─► ALLOCATING ─► ALLOCATED ─► PROVISIONING ─► COMPLETED
//!                                  (allocation child)         (provision child)
//! ```
//!
//! The request names an existing compute description or carries a new
//! one. Either way the description is flagged so that the provisioned
//! computes are registered as container hosts. The task finishes with
//! the links of the provisioned computes.

use std::collections::BTreeMap;

use armada_tasks::domain::{overwrite_if_some, NoBody, TaskBody, TaskRequest};
use armada_tasks::engine::{StageContext, TaskOf, Workflow};
use armada_tasks::{FailureDetail, SubStage, TaskError, CONTEXT_ID_KEY};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::constants::{ENABLE_CONTAINER_HOST_KEY, ENDPOINT_LINK_KEY};
use crate::registry::{ResourceState, ResourceType};
use crate::workflows::compute_allocation::{AllocationBody, ComputeAllocation};
use crate::workflows::compute_provision::ComputeProvision;
use crate::workflows::{context_id_of, Services};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostSubStage {
    Created,
    DescriptionCreated,
    Allocating,
    Allocated,
    Provisioning,
    Completed,
    Error,
}

impl SubStage for HostSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::DescriptionCreated,
        Self::Allocating,
        Self::Allocated,
        Self::Provisioning,
        Self::Completed,
        Self::Error,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::DescriptionCreated => "DESCRIPTION_CREATED",
            Self::Allocating => "ALLOCATING",
            Self::Allocated => "ALLOCATED",
            Self::Provisioning => "PROVISIONING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    fn is_transient(self) -> bool {
        matches!(self, Self::Allocating | Self::Provisioning)
    }
}

/// A compute description supplied inline with the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDescription {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHostBody {
    /// Existing description to provision from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_description_link: Option<String>,
    /// New description to register and provision from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_description: Option<HostDescription>,
    /// Endpoint managing the hosts; required with `hostDescription`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_link: Option<String>,
}

impl TaskBody for ContainerHostBody {
    fn merge(&mut self, patch: Self) {
        overwrite_if_some(&mut self.compute_description_link, patch.compute_description_link);
        overwrite_if_some(&mut self.host_description, patch.host_description);
        overwrite_if_some(&mut self.endpoint_link, patch.endpoint_link);
    }
}

/// Provisions container hosts; see the module docs.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use armada::adapter::ScriptedAdapter;
/// use armada::registry::ResourceRegistry;
/// use armada::workflows::container_hosts::{ContainerHostBody, HostDescription};
/// use armada::workflows::{register_all, Adapters, ContainerHostProvisioning, Services};
/// use armada_tasks::config::EngineConfig;
/// use armada_tasks::domain::TaskRequest;
/// use armada_tasks::engine::TaskEngine;
/// use armada_tasks::store::{memory::InMemoryBackend, TaskStore};
/// use armada_tasks::TaskStage;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let engine = TaskEngine::new(TaskStore::new(InMemoryBackend::new()), EngineConfig::default());
/// let services = Services::new(
///     Arc::new(ResourceRegistry::new()),
///     Adapters::uniform(Arc::new(ScriptedAdapter::new("docker"))),
/// );
/// register_all(&engine, &services);
///
/// let body = ContainerHostBody {
///     host_description: Some(HostDescription { name: "docker-host".into(), ..Default::default() }),
///     endpoint_link: Some("/endpoints/vsphere".into()),
///     ..Default::default()
/// };
/// let address = engine
///     .start::<ContainerHostProvisioning>(TaskRequest::new(body).with_resource_count(2))
///     .await
///     .unwrap();
/// let header = engine.await_terminal(&address, Duration::from_secs(5)).await.unwrap();
/// assert_eq!(header.stage, TaskStage::Finished);
/// let task = engine.get::<ContainerHostProvisioning>(&address).await.unwrap();
/// assert_eq!(task.resource_links.len(), 2);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct ContainerHostProvisioning {
    services: Services,
}

impl ContainerHostProvisioning {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Registers the inline description, or flags the referenced one.
    fn create_description(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), FailureDetail> {
        let context_id = context_id_of(task);
        let mut next = ctx
            .next(HostSubStage::DescriptionCreated)
            .with_custom_property(CONTEXT_ID_KEY, &context_id);

        match (&task.body.host_description, &task.body.compute_description_link) {
            (Some(description), _) => {
                let mut state = ResourceState::new(
                    ResourceType::ComputeDescription,
                    task.address.id(),
                    &description.name,
                )
                .with_correlation_id(&context_id)
                .with_custom_properties(description.custom_properties.clone())
                .with_custom_property(ENABLE_CONTAINER_HOST_KEY, "true");
                if let Some(endpoint) = &task.body.endpoint_link {
                    state = state.with_custom_property(ENDPOINT_LINK_KEY, endpoint);
                }
                if let Some(instance_type) = &description.instance_type {
                    state = state.with_custom_property("instanceType", instance_type);
                }
                let link = state.link.clone();
                if self.services.registry.ensure(state)? {
                    tracing::info!(address = %ctx.address(), description = %link, "created compute description");
                }
                next = next.with_body(json!({ "computeDescriptionLink": link }));
            }
            (None, Some(link)) => {
                let description = self.services.registry.update(link, |d| {
                    d.custom_properties
                        .insert(ENABLE_CONTAINER_HOST_KEY.to_string(), "true".to_string());
                })?;
                if let Some(endpoint) = description.property(ENDPOINT_LINK_KEY) {
                    next = next.with_body(json!({ "endpointLink": endpoint }));
                }
            }
            (None, None) => {
                return Err(FailureDetail::validation(
                    "'computeDescriptionLink' or 'hostDescription' must be set",
                ));
            }
        }
        ctx.send(next);
        Ok(())
    }

    async fn allocate(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), TaskError> {
        let body = AllocationBody {
            compute_description_link: task.body.compute_description_link.clone(),
            ..AllocationBody::default()
        };
        ctx.start_child::<ComputeAllocation>(
            TaskRequest::new(body)
                .with_id(task.address.id())
                .with_resource_count(task.resource_count.unwrap_or(1))
                .with_custom_properties(task.custom_properties.clone())
                .with_tenant_links(task.tenant_links.clone())
                .with_correlation_id(context_id_of(task))
                .with_callback(ctx.link(HostSubStage::Allocated)),
        )
        .await?;
        ctx.proceed(HostSubStage::Allocating);
        Ok(())
    }

    async fn provision(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), TaskError> {
        ctx.start_child::<ComputeProvision>(
            TaskRequest::new(NoBody {})
                .with_id(task.address.id())
                .with_resource_links(task.resource_links.clone())
                .with_custom_properties(task.custom_properties.clone())
                .with_tenant_links(task.tenant_links.clone())
                .with_correlation_id(context_id_of(task))
                .with_callback(ctx.link(HostSubStage::Completed)),
        )
        .await?;
        ctx.proceed(HostSubStage::Provisioning);
        Ok(())
    }
}

#[async_trait]
impl Workflow for ContainerHostProvisioning {
    type SubStage = HostSubStage;
    type Body = ContainerHostBody;
    const KIND: &'static str = "container-host-provisioning";

    fn display_name(&self) -> &'static str {
        "Container Host Provisioning"
    }

    fn validate(&self, task: &TaskOf<Self>) -> Result<(), String> {
        let body = &task.body;
        if body.compute_description_link.is_none() && body.host_description.is_none() {
            return Err("'computeDescriptionLink' or 'hostDescription' must be set".to_string());
        }
        if body.host_description.is_some() && body.endpoint_link.as_deref().unwrap_or_default().is_empty() {
            return Err("'endpointLink' must not be empty".to_string());
        }
        match task.resource_count {
            Some(count) if count > 0 => Ok(()),
            _ => Err("'resourceCount' must be greater than 0.".to_string()),
        }
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            HostSubStage::Created => {
                if let Err(failure) = self.create_description(&ctx, &task) {
                    ctx.fail(failure);
                }
            }
            HostSubStage::DescriptionCreated => self.allocate(&ctx, &task).await?,
            HostSubStage::Allocated => self.provision(&ctx, &task).await?,
            HostSubStage::Allocating
            | HostSubStage::Provisioning
            | HostSubStage::Completed
            | HostSubStage::Error => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_tasks::domain::TaskRecord;
    use armada_tasks::TaskAddress;

    use crate::adapter::ScriptedAdapter;
    use crate::registry::ResourceRegistry;
    use crate::workflows::Adapters;
    use std::sync::Arc;

    fn workflow() -> ContainerHostProvisioning {
        ContainerHostProvisioning::new(Services::new(
            Arc::new(ResourceRegistry::new()),
            Adapters::uniform(Arc::new(ScriptedAdapter::new("docker"))),
        ))
    }

    fn task(body: ContainerHostBody, count: Option<u64>) -> TaskOf<ContainerHostProvisioning> {
        let mut request = TaskRequest::new(body);
        if let Some(count) = count {
            request = request.with_resource_count(count);
        }
        TaskRecord::new(TaskAddress::new(ContainerHostProvisioning::KIND, "1"), request)
    }

    #[test]
    fn request_needs_a_description() {
        let err = workflow().validate(&task(ContainerHostBody::default(), Some(1))).unwrap_err();
        assert_eq!(err, "'computeDescriptionLink' or 'hostDescription' must be set");
    }

    #[test]
    fn inline_description_needs_an_endpoint() {
        let body = ContainerHostBody {
            host_description: Some(HostDescription {
                name: "h".to_string(),
                ..HostDescription::default()
            }),
            ..ContainerHostBody::default()
        };
        let err = workflow().validate(&task(body, Some(1))).unwrap_err();
        assert_eq!(err, "'endpointLink' must not be empty");
    }

    #[test]
    fn resource_count_must_be_positive() {
        let body = ContainerHostBody {
            compute_description_link: Some("/resources/compute-descriptions/d".to_string()),
            ..ContainerHostBody::default()
        };
        let workflow = workflow();
        assert!(workflow.validate(&task(body.clone(), Some(0))).is_err());
        assert!(workflow.validate(&task(body.clone(), None)).is_err());
        assert!(workflow.validate(&task(body, Some(3))).is_ok());
    }

    #[test]
    fn allocation_callbacks_may_overtake_the_transient_stage() {
        assert!(HostSubStage::Allocating.is_transient());
        assert!(!HostSubStage::Allocated.is_transient());
        assert!(HostSubStage::Allocating.can_advance_to(HostSubStage::Allocated));
        assert!(!HostSubStage::Allocated.can_advance_to(HostSubStage::Allocating));
    }
}
