//! Placement helpers for composite provisioning.
//!
//! [`Reservation`] picks a group placement with enough free instances and
//! reserves them. [`PlacementHostSelection`] picks container hosts from
//! the resource pools of a placement, least loaded first.

use std::collections::{BTreeMap, BTreeSet};

use armada_tasks::domain::{overwrite_if_some, TaskBody};
use armada_tasks::engine::{CallbackPayload, StageContext, TaskOf, Workflow};
use armada_tasks::{FailureDetail, SubStage, TaskError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::constants::{
    AVAILABLE_INSTANCES_KEY, CONTAINER_HOST_REGISTERED_KEY, HOST_LINK_KEY, RESOURCE_POOL_LINK_KEY,
};
use crate::registry::{ResourceState, ResourceType};
use crate::workflows::Services;

/// Prefix of the per-task reservation markers kept on a placement.
const RESERVATION_KEY_PREFIX: &str = "__reservation:";

// ---- Reservation ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationSubStage {
    Created,
    Selected,
    Completed,
    Error,
}

impl SubStage for ReservationSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[Self::Created, Self::Selected, Self::Completed, Self::Error];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Selected => "SELECTED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_placement_link: Option<String>,
}

impl TaskBody for ReservationBody {
    fn merge(&mut self, patch: Self) {
        overwrite_if_some(&mut self.group_placement_link, patch.group_placement_link);
    }
}

/// Reserves `resourceCount` instances on a group placement.
///
/// Placements without an `__availableInstances` property have unlimited
/// capacity. Candidates are tried in link order.
#[derive(Debug, Clone)]
pub struct Reservation {
    services: Services,
}

fn available_instances(placement: &ResourceState) -> Option<u64> {
    placement
        .property(AVAILABLE_INSTANCES_KEY)
        .and_then(|v| v.parse().ok())
}

impl Reservation {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn select(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) {
        let count = task.resource_count.unwrap_or(1);
        let candidate = self
            .services
            .registry
            .list(ResourceType::GroupPlacement)
            .into_iter()
            .find(|p| available_instances(p).is_none_or(|free| free >= count));
        match candidate {
            Some(placement) => {
                tracing::debug!(address = %ctx.address(), placement = %placement.link, count, "selected group placement");
                ctx.send(
                    ctx.next(ReservationSubStage::Selected)
                        .with_body(json!({ "groupPlacementLink": placement.link })),
                );
            }
            None => ctx.fail(FailureDetail::validation(format!(
                "No group placement has {count} available instances"
            ))),
        }
    }

    /// Takes the instances from the selected placement. A marker keyed by
    /// task id makes a repeated run a no-op.
    fn reserve(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), FailureDetail> {
        let link = task
            .body
            .group_placement_link
            .as_deref()
            .ok_or_else(|| FailureDetail::internal("no group placement selected"))?;
        let count = task.resource_count.unwrap_or(1);
        let marker = format!("{RESERVATION_KEY_PREFIX}{}", task.address.id());
        let mut reserved = false;
        self.services.registry.update(link, |placement| {
            if placement.custom_properties.contains_key(&marker) {
                reserved = true;
                return;
            }
            match available_instances(placement) {
                Some(free) if free < count => {}
                Some(free) => {
                    placement
                        .custom_properties
                        .insert(AVAILABLE_INSTANCES_KEY.to_string(), (free - count).to_string());
                    placement.custom_properties.insert(marker.clone(), count.to_string());
                    reserved = true;
                }
                None => {
                    placement.custom_properties.insert(marker.clone(), count.to_string());
                    reserved = true;
                }
            }
        })?;
        if !reserved {
            return Err(FailureDetail::validation(format!(
                "Group placement {link} no longer has {count} available instances"
            )));
        }
        tracing::info!(address = %ctx.address(), placement = %link, count, "reserved instances");
        ctx.complete();
        Ok(())
    }
}

#[async_trait]
impl Workflow for Reservation {
    type SubStage = ReservationSubStage;
    type Body = ReservationBody;
    const KIND: &'static str = "reservation";

    fn display_name(&self) -> &'static str {
        "Reservation"
    }

    fn validate(&self, task: &TaskOf<Self>) -> Result<(), String> {
        match task.resource_count {
            Some(0) => Err("'resourceCount' must be greater than 0.".to_string()),
            _ => Ok(()),
        }
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            ReservationSubStage::Created => self.select(&ctx, &task),
            ReservationSubStage::Selected => {
                if let Err(failure) = self.reserve(&ctx, &task) {
                    ctx.fail(failure);
                }
            }
            ReservationSubStage::Completed | ReservationSubStage::Error => {}
        }
        Ok(())
    }

    fn finished_payload(&self, task: &TaskOf<Self>) -> CallbackPayload {
        CallbackPayload::default().with_body(json!({
            "groupPlacementLink": task.body.group_placement_link,
        }))
    }
}

// ---- Host selection ----

/// One selected container host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSelection {
    pub host_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool_link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionSubStage {
    Created,
    Completed,
    Error,
}

impl SubStage for SelectionSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[Self::Created, Self::Completed, Self::Error];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionBody {
    #[serde(default)]
    pub resource_pool_links: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_selections: Vec<HostSelection>,
}

impl TaskBody for SelectionBody {
    fn merge(&mut self, patch: Self) {
        self.resource_pool_links.extend(patch.resource_pool_links);
        if !patch.host_selections.is_empty() {
            self.host_selections = patch.host_selections;
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.resource_pool_links.is_empty() {
            return Err("'resourcePoolLinks' must not be empty".to_string());
        }
        Ok(())
    }
}

/// Selects `resourceCount` registered container hosts from the given
/// resource pools. Hosts already carrying fewer composite components are
/// preferred; with more requested than available, hosts are reused.
#[derive(Debug, Clone)]
pub struct PlacementHostSelection {
    services: Services,
}

impl PlacementHostSelection {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn select_hosts(&self, pools: &BTreeSet<String>, count: usize) -> Vec<HostSelection> {
        let registry = &self.services.registry;
        let mut load: BTreeMap<String, usize> = BTreeMap::new();
        for component in registry.list(ResourceType::CompositeComponent) {
            if let Some(host) = component.property(HOST_LINK_KEY) {
                *load.entry(host.to_string()).or_insert(0) += 1;
            }
        }

        let mut hosts: Vec<HostSelection> = registry
            .list(ResourceType::Compute)
            .into_iter()
            .filter(|c| c.property(CONTAINER_HOST_REGISTERED_KEY) == Some("true"))
            .filter_map(|c| {
                let pool = c.property(RESOURCE_POOL_LINK_KEY)?;
                pools.contains(pool).then(|| HostSelection {
                    host_link: c.link.clone(),
                    resource_pool_link: Some(pool.to_string()),
                })
            })
            .collect();
        // Stable: equal load keeps link order.
        hosts.sort_by_key(|h| load.get(&h.host_link).copied().unwrap_or(0));
        hosts.into_iter().cycle().take(count).collect()
    }
}

#[async_trait]
impl Workflow for PlacementHostSelection {
    type SubStage = SelectionSubStage;
    type Body = SelectionBody;
    const KIND: &'static str = "placement-host-selection";

    fn display_name(&self) -> &'static str {
        "Placement Host Selection"
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            SelectionSubStage::Created => {
                let count = usize::try_from(task.resource_count.unwrap_or(1)).unwrap_or(usize::MAX);
                let selections = self.select_hosts(&task.body.resource_pool_links, count);
                if selections.is_empty() {
                    ctx.fail(FailureDetail::validation(format!(
                        "No container hosts available in resource pools {:?}",
                        task.body.resource_pool_links
                    )));
                } else {
                    ctx.send(
                        ctx.next(SelectionSubStage::Completed)
                            .with_body(json!({ "hostSelections": selections })),
                    );
                }
            }
            SelectionSubStage::Completed | SelectionSubStage::Error => {}
        }
        Ok(())
    }

    fn finished_payload(&self, task: &TaskOf<Self>) -> CallbackPayload {
        CallbackPayload::default().with_body(json!({ "hostSelections": task.body.host_selections }))
    }
}
