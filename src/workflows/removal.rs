//! Composite removal.
//!
//! The task's resource links are composite components. Their component
//! resources are deleted one resource type at a time, in the configured
//! removal order. Each dispatch of `INSTANCES_REMOVING` fans out the
//! deletes of the first type still registered; the group's completion
//! re-enters `INSTANCES_REMOVING` with `removedGroups` bumped, and the
//! first failed delete fails the task at once. The composite records go
//! last.
//!
//! With `cleanupOnly` no adapter is called: the component records, all
//! their descendants and everything carrying the task's correlation id
//! are dropped from the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use armada_tasks::compensator::Compensator;
use armada_tasks::domain::{overwrite_if_some, TaskBody};
use armada_tasks::engine::{Repeat, StageContext, TaskOf, Workflow};
use armada_tasks::{FailureDetail, SubStage, TaskError, TaskUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::adapter::{execute_with_retry, AdapterOperation, AdapterRequest};
use crate::registry::ResourceType;
use crate::workflows::Services;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalSubStage {
    Created,
    InstancesRemoving,
    CompositeRemoving,
    Completed,
    Error,
}

impl SubStage for RemovalSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::InstancesRemoving,
        Self::CompositeRemoving,
        Self::Completed,
        Self::Error,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::InstancesRemoving => "INSTANCES_REMOVING",
            Self::CompositeRemoving => "COMPOSITE_REMOVING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    fn is_transient(self) -> bool {
        matches!(self, Self::InstancesRemoving)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_only: Option<bool>,
    /// Resource type groups deleted so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_groups: Option<u32>,
}

impl TaskBody for RemovalBody {
    fn merge(&mut self, patch: Self) {
        overwrite_if_some(&mut self.cleanup_only, patch.cleanup_only);
        overwrite_if_some(&mut self.removed_groups, patch.removed_groups);
    }
}

const REMOVED_GROUPS_KEY: &str = "removedGroups";

/// Groups `links` by resource type in `order`.
///
/// # Errors
///
/// Returns the names of the types, or the raw links, that `order` does
/// not cover.
pub fn removal_groups(
    links: &BTreeSet<String>,
    order: &[ResourceType],
) -> Result<Vec<(ResourceType, Vec<String>)>, Vec<String>> {
    let mut by_type: BTreeMap<ResourceType, Vec<String>> = BTreeMap::new();
    let mut unknown: BTreeSet<String> = BTreeSet::new();
    for link in links {
        match ResourceType::from_link(link) {
            Some(t) if order.contains(&t) => by_type.entry(t).or_default().push(link.clone()),
            Some(t) => {
                unknown.insert(t.name().to_string());
            }
            None => {
                unknown.insert(link.clone());
            }
        }
    }
    if !unknown.is_empty() {
        return Err(unknown.into_iter().collect());
    }
    Ok(order
        .iter()
        .filter_map(|t| by_type.remove(t).map(|links| (*t, links)))
        .collect())
}

/// Removes composite components; see the module docs.
#[derive(Debug, Clone)]
pub struct CompositeRemoval {
    services: Services,
}

impl CompositeRemoval {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn cleanup(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) {
        let compensator = Compensator::new(Arc::clone(&self.services.registry));
        let address = ctx.address().clone();
        compensator.run(
            ctx.engine(),
            address.clone(),
            task.resource_links.clone(),
            task.context_id().map(str::to_string),
            move |deleted| {
                tracing::info!(address = %address, removed = deleted.len(), "cleaned up composite records");
                TaskUpdate::to_sub_stage(address, RemovalSubStage::Completed)
            },
        );
    }

    /// Deletes the first resource type group still registered under the
    /// composites, or moves on once none is left.
    fn remove_next_group(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) {
        let registry = &self.services.registry;
        let removed_groups = task.body.removed_groups.unwrap_or(0);
        let components: BTreeSet<String> = task
            .resource_links
            .iter()
            .flat_map(|composite| registry.children(composite))
            .collect();
        let groups = match removal_groups(&components, &self.services.settings.removal_order) {
            Ok(groups) => groups,
            Err(unknown) => {
                ctx.fail(FailureDetail::validation(format!(
                    "Unknown order of removal for resource types: {}",
                    unknown.join(", ")
                )));
                return;
            }
        };
        let Some((resource_type, links)) = groups.into_iter().next() else {
            if removed_groups == 0 {
                tracing::warn!(address = %ctx.address(), "composite components have no resources");
            }
            ctx.proceed(RemovalSubStage::CompositeRemoving);
            return;
        };

        let policy = ctx.retry_policy();
        let adapter = self.services.adapters.for_removal(resource_type);
        let operations = links
            .into_iter()
            .map(|link| {
                let adapter = Arc::clone(adapter);
                let registry = Arc::clone(&self.services.registry);
                let request = AdapterRequest::new(&link, AdapterOperation::Delete);
                let id = link.clone();
                let op = async move {
                    execute_with_retry(adapter, request, policy).await?;
                    registry.remove(&link);
                    Ok::<_, FailureDetail>(link)
                };
                (id, op)
            })
            .collect();
        let address = ctx.address().clone();
        let next = ctx
            .next(RemovalSubStage::InstancesRemoving)
            .with_body(json!({ REMOVED_GROUPS_KEY: removed_groups + 1 }));
        ctx.fan_out(operations, move |removed: Vec<String>| {
            tracing::info!(
                address = %address,
                resource_type = %resource_type,
                removed = removed.len(),
                "removed resource group"
            );
            next
        });
    }

    fn remove_composites(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) {
        for composite in &task.resource_links {
            self.services.registry.remove(composite);
        }
        ctx.complete();
    }
}

#[async_trait]
impl Workflow for CompositeRemoval {
    type SubStage = RemovalSubStage;
    type Body = RemovalBody;
    const KIND: &'static str = "composite-removal";

    fn display_name(&self) -> &'static str {
        "Composite Removal"
    }

    /// A finished group re-runs `INSTANCES_REMOVING` once per group count.
    fn on_repeat(&self, task: &TaskOf<Self>, update: &TaskUpdate) -> Repeat {
        let reported = update
            .body
            .as_ref()
            .and_then(|body| body.get(REMOVED_GROUPS_KEY))
            .and_then(serde_json::Value::as_u64);
        match reported {
            Some(groups)
                if task.sub_stage == RemovalSubStage::InstancesRemoving
                    && groups > u64::from(task.body.removed_groups.unwrap_or(0)) =>
            {
                Repeat::MergeAndDispatch
            }
            _ => Repeat::Ignore,
        }
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            RemovalSubStage::Created => {
                if task.resource_links.is_empty() {
                    tracing::debug!(address = %ctx.address(), "nothing to remove");
                    ctx.complete();
                } else {
                    ctx.proceed(RemovalSubStage::InstancesRemoving);
                }
            }
            RemovalSubStage::InstancesRemoving => {
                if task.body.cleanup_only.unwrap_or(false) {
                    self.cleanup(&ctx, &task);
                } else {
                    self.remove_next_group(&ctx, &task);
                }
            }
            RemovalSubStage::CompositeRemoving => self.remove_composites(&ctx, &task),
            RemovalSubStage::Completed | RemovalSubStage::Error => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn links(raw: &[&str]) -> BTreeSet<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn groups_follow_the_removal_order() {
        let order = [ResourceType::Container, ResourceType::Compute, ResourceType::Network];
        let groups = removal_groups(
            &links(&["/resources/networks/n", "/resources/containers/b", "/resources/containers/a"]),
            &order,
        )
        .unwrap();
        assert_eq!(
            groups,
            vec![
                (
                    ResourceType::Container,
                    vec!["/resources/containers/a".to_string(), "/resources/containers/b".to_string()]
                ),
                (ResourceType::Network, vec!["/resources/networks/n".to_string()]),
            ]
        );
    }

    #[test]
    fn types_outside_the_order_are_reported() {
        let err = removal_groups(
            &links(&["/resources/volumes/v", "/resources/containers/a", "/elsewhere/x"]),
            &[ResourceType::Container],
        )
        .unwrap_err();
        assert_eq!(err, vec!["/elsewhere/x".to_string(), "VOLUME".to_string()]);
    }
}
