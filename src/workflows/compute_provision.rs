//! Provisioning of allocated compute resources.
//!
//! [`ComputeProvision`] starts one [`ComputeInstanceProvisioning`] child
//! per compute link and a counter that waits for all of them. Once the
//! counter finishes, computes flagged as container hosts get their
//! connection validated, retried under the host-connection policy.

use std::collections::BTreeMap;
use std::sync::Arc;

use armada_tasks::counter::{CounterBody, CounterSubStage, CounterWorkflow};
use armada_tasks::domain::{overwrite_if_some, NoBody, TaskBody, TaskRequest};
use armada_tasks::engine::{StageContext, TaskOf, Workflow};
use armada_tasks::{FailureDetail, StageTarget, SubStage, TaskError, TaskLink, TaskUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::adapter::{execute_with_retry, AdapterOperation, AdapterRequest, AdapterResponse};
use crate::constants::{CONTAINER_HOST_REGISTERED_KEY, ENABLE_CONTAINER_HOST_KEY};
use crate::workflows::{context_id_of, Services};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionSubStage {
    Created,
    ProvisioningCompute,
    ProvisioningComputeCompleted,
    Completed,
    Error,
}

impl SubStage for ProvisionSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::ProvisioningCompute,
        Self::ProvisioningComputeCompleted,
        Self::Completed,
        Self::Error,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::ProvisioningCompute => "PROVISIONING_COMPUTE",
            Self::ProvisioningComputeCompleted => "PROVISIONING_COMPUTE_COMPLETED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    fn is_transient(self) -> bool {
        matches!(self, Self::ProvisioningCompute)
    }
}

/// Provisions every compute in the task's resource links.
#[derive(Debug, Clone)]
pub struct ComputeProvision {
    services: Services,
}

impl ComputeProvision {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn start_instances(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), TaskError> {
        let context_id = context_id_of(task);
        let counter = ctx
            .start_child::<CounterWorkflow>(
                TaskRequest::new(CounterBody::expecting(task.resource_links.len() as u64))
                    .with_id(task.address.as_str())
                    .with_correlation_id(&context_id)
                    .with_callback(ctx.link(ProvisionSubStage::ProvisioningComputeCompleted)),
            )
            .await?;
        let to_counter = TaskLink::with_targets(
            counter,
            StageTarget::started(CounterSubStage::Counting),
            StageTarget::started(CounterSubStage::Error),
        );

        for (index, link) in task.resource_links.iter().enumerate() {
            ctx.start_child::<ComputeInstanceProvisioning>(
                TaskRequest::new(InstanceBody {
                    compute_link: Some(link.clone()),
                })
                .with_id(format!("{}-{}", task.address.id(), index + 1))
                .with_resource_links([link.clone()])
                .with_custom_properties(task.custom_properties.clone())
                .with_tenant_links(task.tenant_links.clone())
                .with_correlation_id(&context_id)
                .with_callback(to_counter.clone()),
            )
            .await?;
        }
        ctx.proceed(ProvisionSubStage::ProvisioningCompute);
        Ok(())
    }

    /// Validates the connection of every compute flagged as container
    /// host, then completes.
    fn register_hosts(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) {
        let registry = &self.services.registry;
        let hosts: Vec<String> = task
            .resource_links
            .iter()
            .filter(|link| {
                registry
                    .get(link)
                    .is_ok_and(|c| c.property(ENABLE_CONTAINER_HOST_KEY) == Some("true"))
            })
            .cloned()
            .collect();
        if hosts.is_empty() {
            tracing::debug!(address = %ctx.address(), "no container hosts to register");
            ctx.complete();
            return;
        }

        let policy = self.services.settings.host_connection_retry;
        let operations = hosts
            .into_iter()
            .map(|link| {
                let adapter = Arc::clone(&self.services.adapters.compute);
                let registry = Arc::clone(&self.services.registry);
                let request = AdapterRequest::new(&link, AdapterOperation::Validate)
                    .with_custom_properties(task.custom_properties.clone());
                let id = link.clone();
                let op = async move {
                    execute_with_retry(adapter, request, policy)
                        .await
                        .map_err(|mut failure| {
                            failure.message = format!("Failed registering container host {link}: {}", failure.message);
                            failure
                        })?;
                    registry.update(&link, |host| {
                        host.custom_properties
                            .insert(CONTAINER_HOST_REGISTERED_KEY.to_string(), "true".to_string());
                    })?;
                    Ok::<_, FailureDetail>(link)
                };
                (id, op)
            })
            .collect();
        let address = ctx.address().clone();
        ctx.fan_out(operations, move |registered| {
            tracing::info!(address = %address, hosts = registered.len(), "registered container hosts");
            TaskUpdate::to_sub_stage(address, ProvisionSubStage::Completed)
        });
    }
}

#[async_trait]
impl Workflow for ComputeProvision {
    type SubStage = ProvisionSubStage;
    type Body = NoBody;
    const KIND: &'static str = "compute-provision";

    fn display_name(&self) -> &'static str {
        "Compute Provision"
    }

    fn validate(&self, task: &TaskOf<Self>) -> Result<(), String> {
        if task.resource_links.is_empty() {
            return Err("No compute instances to provision".to_string());
        }
        Ok(())
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            ProvisionSubStage::Created => self.start_instances(&ctx, &task).await?,
            ProvisionSubStage::ProvisioningCompute => {}
            ProvisionSubStage::ProvisioningComputeCompleted => self.register_hosts(&ctx, &task),
            ProvisionSubStage::Completed | ProvisionSubStage::Error => {}
        }
        Ok(())
    }
}

// ---- One compute ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceSubStage {
    Created,
    CreatingHost,
    Completed,
    Error,
}

impl SubStage for InstanceSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[Self::Created, Self::CreatingHost, Self::Completed, Self::Error];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::CreatingHost => "CREATING_HOST",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    fn is_transient(self) -> bool {
        matches!(self, Self::CreatingHost)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_link: Option<String>,
}

impl TaskBody for InstanceBody {
    fn merge(&mut self, patch: Self) {
        overwrite_if_some(&mut self.compute_link, patch.compute_link);
    }

    fn validate(&self) -> Result<(), String> {
        match self.compute_link.as_deref() {
            Some(link) if !link.is_empty() => Ok(()),
            _ => Err("'computeLink' must not be empty".to_string()),
        }
    }
}

/// Creates one compute through the compute adapter.
#[derive(Debug, Clone)]
pub struct ComputeInstanceProvisioning {
    services: Services,
}

impl ComputeInstanceProvisioning {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn create(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) {
        let link = task.body.compute_link.clone().unwrap_or_default();
        let adapter = Arc::clone(&self.services.adapters.compute);
        let registry = Arc::clone(&self.services.registry);
        let request = AdapterRequest::new(&link, AdapterOperation::Create)
            .with_custom_properties(task.custom_properties.clone());
        let address = ctx.address().clone();
        ctx.spawn_with_retry(
            format!("create compute {link}"),
            ctx.retry_policy(),
            move |_attempt| {
                let adapter = Arc::clone(&adapter);
                let request = request.clone();
                async move { adapter.execute(&request).await }
            },
            move |response: AdapterResponse| {
                let properties: BTreeMap<String, String> = response.custom_properties;
                match registry.update(&link, |compute| compute.custom_properties.extend(properties)) {
                    Ok(_) => TaskUpdate::to_sub_stage(address, InstanceSubStage::Completed)
                        .with_resource_links(response.resource_links),
                    Err(e) => TaskUpdate::failed(address, e.into()),
                }
            },
        );
    }
}

#[async_trait]
impl Workflow for ComputeInstanceProvisioning {
    type SubStage = InstanceSubStage;
    type Body = InstanceBody;
    const KIND: &'static str = "compute-instance-provision";

    fn display_name(&self) -> &'static str {
        "Compute Instance Provision"
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            InstanceSubStage::Created => ctx.proceed(InstanceSubStage::CreatingHost),
            InstanceSubStage::CreatingHost => self.create(&ctx, &task),
            InstanceSubStage::Completed | InstanceSubStage::Error => {}
        }
        Ok(())
    }

    fn self_delete(&self) -> bool {
        true
    }
}
