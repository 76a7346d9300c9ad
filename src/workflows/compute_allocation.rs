//! Allocation of compute records for a container-host request.
//!
//! Registers `resourceCount` compute resources from one compute
//! description and hands their links to the parent. Nothing remote is
//! called; the records are provisioned later by
//! [`ComputeProvision`](super::ComputeProvision).

use std::collections::BTreeSet;

use armada_tasks::domain::{overwrite_if_some, TaskBody};
use armada_tasks::engine::{StageContext, TaskOf, Workflow};
use armada_tasks::{FailureDetail, SubStage, TaskError, CONTEXT_ID_KEY};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::constants::RESOURCE_POOL_LINK_KEY;
use crate::registry::{ResourceState, ResourceType};
use crate::workflows::{context_id_of, Services};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationSubStage {
    Created,
    ContextPrepared,
    Completed,
    Error,
}

impl SubStage for AllocationSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::ContextPrepared,
        Self::Completed,
        Self::Error,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::ContextPrepared => "CONTEXT_PREPARED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_description_link: Option<String>,
    /// Prefix of the generated compute names; the description name when
    /// not given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool_link: Option<String>,
}

impl TaskBody for AllocationBody {
    fn merge(&mut self, patch: Self) {
        overwrite_if_some(&mut self.compute_description_link, patch.compute_description_link);
        overwrite_if_some(&mut self.name_prefix, patch.name_prefix);
        overwrite_if_some(&mut self.resource_pool_link, patch.resource_pool_link);
    }

    fn validate(&self) -> Result<(), String> {
        match self.compute_description_link.as_deref() {
            Some(link) if !link.is_empty() => Ok(()),
            _ => Err("'computeDescriptionLink' must not be empty".to_string()),
        }
    }
}

/// Registers compute records; see the module docs.
#[derive(Debug, Clone)]
pub struct ComputeAllocation {
    services: Services,
}

impl ComputeAllocation {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn prepare_context(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) {
        let Some(description_link) = task.body.compute_description_link.as_deref() else {
            ctx.fail(FailureDetail::validation("'computeDescriptionLink' must not be empty"));
            return;
        };
        let description = match self.services.registry.get(description_link) {
            Ok(description) => description,
            Err(e) => {
                ctx.fail(e.into());
                return;
            }
        };
        let name_prefix = task
            .body
            .name_prefix
            .clone()
            .unwrap_or_else(|| description.name.clone());
        let mut patch = json!({ "namePrefix": name_prefix });
        if let Some(pool) = description.property(RESOURCE_POOL_LINK_KEY) {
            patch["resourcePoolLink"] = json!(pool);
        }
        ctx.send(
            ctx.next(AllocationSubStage::ContextPrepared)
                .with_custom_property(CONTEXT_ID_KEY, context_id_of(task))
                .with_body(patch),
        );
    }

    fn allocate(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), FailureDetail> {
        let description_link = task
            .body
            .compute_description_link
            .as_deref()
            .unwrap_or_default();
        let description = self.services.registry.get(description_link)?;
        let context_id = context_id_of(task);
        let prefix = task.body.name_prefix.as_deref().unwrap_or(&description.name);
        let count = task.resource_count.unwrap_or(0);

        let mut links = BTreeSet::new();
        for index in 1..=count {
            let mut compute = ResourceState::new(
                ResourceType::Compute,
                &format!("{}-{index}", task.address.id()),
                format!("{prefix}-{index}"),
            )
            .with_correlation_id(&context_id)
            .with_custom_properties(description.custom_properties.clone())
            .with_custom_property(CONTEXT_ID_KEY, &context_id);
            if let Some(pool) = &task.body.resource_pool_link {
                compute = compute.with_custom_property(RESOURCE_POOL_LINK_KEY, pool);
            }
            links.insert(compute.link.clone());
            self.services.registry.ensure(compute)?;
        }
        tracing::info!(address = %ctx.address(), count, description = %description_link, "allocated compute resources");
        ctx.send(ctx.next(AllocationSubStage::Completed).with_resource_links(links));
        Ok(())
    }
}

#[async_trait]
impl Workflow for ComputeAllocation {
    type SubStage = AllocationSubStage;
    type Body = AllocationBody;
    const KIND: &'static str = "compute-allocation";

    fn display_name(&self) -> &'static str {
        "Compute Allocation"
    }

    fn validate(&self, task: &TaskOf<Self>) -> Result<(), String> {
        match task.resource_count {
            Some(count) if count > 0 => Ok(()),
            _ => Err("'resourceCount' must be greater than 0.".to_string()),
        }
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            AllocationSubStage::Created => self.prepare_context(&ctx, &task),
            AllocationSubStage::ContextPrepared => {
                if let Err(failure) = self.allocate(&ctx, &task) {
                    ctx.fail(failure);
                }
            }
            AllocationSubStage::Completed | AllocationSubStage::Error => {}
        }
        Ok(())
    }
}
