//! Kubernetes composite provisioning.
//!
//! ```text
//! CREATED ─► CONTEXT_PREPARED ─► RESERVING ─► RESERVED ─► PLACEMENT_HOST_SELECTED ─► COMPLETED
//!                               (reservation)            (host selection, APPLY)
//! ```
//!
//! A request that already names a group placement skips the reservation;
//! one that already carries host selections skips the host selection.
//! The composite component is applied through the Kubernetes adapter,
//! which reports back to `COMPLETED` or `ERROR`.

use std::sync::Arc;

use armada_tasks::domain::{overwrite_if_some, TaskBody, TaskRequest};
use armada_tasks::engine::{StageContext, TaskOf, Workflow};
use armada_tasks::{FailureDetail, SubStage, TaskError, CONTEXT_ID_KEY};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::adapter::{submit, AdapterOperation, AdapterRequest};
use crate::constants::{HOST_LINK_KEY, RESOURCE_POOL_LINK_KEY};
use crate::workflows::placement::{
    HostSelection, PlacementHostSelection, Reservation, ReservationBody, SelectionBody,
};
use crate::workflows::{context_id_of, Services};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KubernetesSubStage {
    Created,
    ContextPrepared,
    Reserving,
    Reserved,
    PlacementHostSelected,
    Completed,
    Error,
}

impl SubStage for KubernetesSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::ContextPrepared,
        Self::Reserving,
        Self::Reserved,
        Self::PlacementHostSelected,
        Self::Completed,
        Self::Error,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::ContextPrepared => "CONTEXT_PREPARED",
            Self::Reserving => "RESERVING",
            Self::Reserved => "RESERVED",
            Self::PlacementHostSelected => "PLACEMENT_HOST_SELECTED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    fn is_transient(self) -> bool {
        matches!(self, Self::Reserving)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_component_link: Option<String>,
    /// Name of the composite description, copied from the component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_placement_link: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_selections: Vec<HostSelection>,
}

impl TaskBody for KubernetesBody {
    fn merge(&mut self, patch: Self) {
        overwrite_if_some(&mut self.composite_component_link, patch.composite_component_link);
        overwrite_if_some(&mut self.desc_name, patch.desc_name);
        overwrite_if_some(&mut self.group_placement_link, patch.group_placement_link);
        if !patch.host_selections.is_empty() {
            self.host_selections = patch.host_selections;
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self.composite_component_link.as_deref() {
            Some(link) if !link.is_empty() => Ok(()),
            _ => Err("'compositeComponentLink' must not be empty".to_string()),
        }
    }
}

/// Provisions a composite application on Kubernetes; see the module
/// docs.
#[derive(Debug, Clone)]
pub struct KubernetesCompositeProvisioning {
    services: Services,
}

impl KubernetesCompositeProvisioning {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn component_link(task: &TaskOf<Self>) -> &str {
        task.body.composite_component_link.as_deref().unwrap_or_default()
    }

    fn prepare_context(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), FailureDetail> {
        let component = self.services.registry.get(Self::component_link(task))?;
        ctx.send(
            ctx.next(KubernetesSubStage::ContextPrepared)
                .with_custom_property(CONTEXT_ID_KEY, context_id_of(task))
                .with_body(json!({ "descName": component.name })),
        );
        Ok(())
    }

    async fn reserve(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), TaskError> {
        if task.body.group_placement_link.is_some() {
            ctx.proceed(KubernetesSubStage::Reserved);
            return Ok(());
        }
        let mut request = TaskRequest::new(ReservationBody::default())
            .with_id(task.address.id())
            .with_resource_count(task.resource_count.unwrap_or(1))
            .with_custom_properties(task.custom_properties.clone())
            .with_tenant_links(task.tenant_links.clone())
            .with_correlation_id(context_id_of(task))
            .with_callback(ctx.link(KubernetesSubStage::Reserved));
        if let Some(description) = &task.resource_description_link {
            request = request.with_resource_description_link(description);
        }
        ctx.start_child::<Reservation>(request).await?;
        ctx.proceed(KubernetesSubStage::Reserving);
        Ok(())
    }

    async fn select_hosts(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), TaskError> {
        if !task.body.host_selections.is_empty() {
            ctx.proceed(KubernetesSubStage::PlacementHostSelected);
            return Ok(());
        }
        let Some(placement_link) = task.body.group_placement_link.as_deref() else {
            ctx.fail(FailureDetail::validation("'groupPlacementLink' is missing after reservation"));
            return Ok(());
        };
        let placement = match self.services.registry.get(placement_link) {
            Ok(placement) => placement,
            Err(e) => {
                ctx.fail(e.into());
                return Ok(());
            }
        };
        let Some(pool) = placement.property(RESOURCE_POOL_LINK_KEY) else {
            ctx.fail(FailureDetail::validation(format!(
                "Group placement {placement_link} has no resource pool"
            )));
            return Ok(());
        };

        let body = SelectionBody {
            resource_pool_links: [pool.to_string()].into(),
            ..SelectionBody::default()
        };
        ctx.start_child::<PlacementHostSelection>(
            TaskRequest::new(body)
                .with_id(task.address.id())
                .with_resource_count(1)
                .with_custom_properties(task.custom_properties.clone())
                .with_correlation_id(context_id_of(task))
                .with_callback(ctx.link(KubernetesSubStage::PlacementHostSelected)),
        )
        .await?;
        Ok(())
    }

    fn apply(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), FailureDetail> {
        let host = task
            .body
            .host_selections
            .first()
            .ok_or_else(|| FailureDetail::internal("no host selected for the composite component"))?;
        let component_link = Self::component_link(task);
        self.services.registry.update(component_link, |component| {
            component
                .custom_properties
                .insert(HOST_LINK_KEY.to_string(), host.host_link.clone());
        })?;

        let request = AdapterRequest::new(component_link, AdapterOperation::Apply)
            .with_custom_properties(task.custom_properties.clone())
            .with_custom_property(HOST_LINK_KEY, &host.host_link)
            .with_callback(ctx.link(KubernetesSubStage::Completed));
        submit(Arc::clone(&self.services.adapters.kubernetes), ctx.engine(), request).map_err(|e| {
            let mut failure = e.to_failure();
            failure.message = format!("AdapterRequest failed for composite component: {}", failure.message);
            failure
        })?;
        tracing::info!(address = %ctx.address(), component = %component_link, host = %host.host_link, "applying composite component");
        Ok(())
    }
}

#[async_trait]
impl Workflow for KubernetesCompositeProvisioning {
    type SubStage = KubernetesSubStage;
    type Body = KubernetesBody;
    const KIND: &'static str = "kubernetes-composite-provisioning";

    fn display_name(&self) -> &'static str {
        "Kubernetes Composite Provisioning"
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            KubernetesSubStage::Created => {
                if let Err(failure) = self.prepare_context(&ctx, &task) {
                    ctx.fail(failure);
                }
            }
            KubernetesSubStage::ContextPrepared => self.reserve(&ctx, &task).await?,
            KubernetesSubStage::Reserved => self.select_hosts(&ctx, &task).await?,
            KubernetesSubStage::PlacementHostSelected => {
                if let Err(failure) = self.apply(&ctx, &task) {
                    ctx.fail(failure);
                }
            }
            KubernetesSubStage::Reserving | KubernetesSubStage::Completed | KubernetesSubStage::Error => {}
        }
        Ok(())
    }
}
