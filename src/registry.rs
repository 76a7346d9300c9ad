//! In-process registry of the resources workflows create.
//!
//! The registry is the persisted-store collaborator of the workflows: it
//! holds compute descriptions, computes, composite components, group
//! placements and the rest, each under a link of the form
//! `/resources/{collection}/{id}`. It answers the compensator's
//! query-by-correlation and parent-link lookups.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use armada_tasks::compensator::ResourceQuery;
use armada_tasks::FailureDetail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Kind of a registered resource, derived from its link.
///
/// # Examples
///
/// ```
/// use armada::registry::ResourceType;
///
/// let link = ResourceType::Container.link("web-1");
/// assert_eq!(link, "/resources/containers/web-1");
/// assert_eq!(ResourceType::from_link(&link), Some(ResourceType::Container));
/// assert_eq!(ResourceType::from_link("/resources/unknown/x"), None);
/// assert_eq!(ResourceType::from_name("VOLUME"), Some(ResourceType::Volume));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Container,
    Compute,
    Network,
    Volume,
    ComputeDescription,
    CompositeComponent,
    GroupPlacement,
    Artifact,
}

impl ResourceType {
    pub const ALL: &'static [Self] = &[
        Self::Container,
        Self::Compute,
        Self::Network,
        Self::Volume,
        Self::ComputeDescription,
        Self::CompositeComponent,
        Self::GroupPlacement,
        Self::Artifact,
    ];

    /// Path segment of the resource collection.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::Compute => "compute",
            Self::Network => "networks",
            Self::Volume => "volumes",
            Self::ComputeDescription => "compute-descriptions",
            Self::CompositeComponent => "composite-components",
            Self::GroupPlacement => "group-placements",
            Self::Artifact => "artifacts",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Container => "CONTAINER",
            Self::Compute => "COMPUTE",
            Self::Network => "NETWORK",
            Self::Volume => "VOLUME",
            Self::ComputeDescription => "COMPUTE_DESCRIPTION",
            Self::CompositeComponent => "COMPOSITE_COMPONENT",
            Self::GroupPlacement => "GROUP_PLACEMENT",
            Self::Artifact => "ARTIFACT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// Link of resource `id` in this collection.
    pub fn link(self, id: &str) -> String {
        format!("/resources/{}/{id}", self.collection())
    }

    /// Resource type named by the collection segment of `link`.
    pub fn from_link(link: &str) -> Option<Self> {
        let rest = link.strip_prefix("/resources/")?;
        let (collection, id) = rest.split_once('/')?;
        if id.is_empty() {
            return None;
        }
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.collection() == collection)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One registered resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub link: String,
    pub resource_type: ResourceType,
    pub name: String,
    /// Resource this one was created under. Descendants are found by
    /// following these links backwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn new(resource_type: ResourceType, id: &str, name: impl Into<String>) -> Self {
        Self {
            link: resource_type.link(id),
            resource_type,
            name: name.into(),
            parent_link: None,
            correlation_id: None,
            custom_properties: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_link: impl Into<String>) -> Self {
        self.parent_link = Some(parent_link.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_custom_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.custom_properties.extend(properties);
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.custom_properties.get(key).map(String::as_str)
    }
}

/// Concurrent map of resources keyed by link.
///
/// # Examples
///
/// ```
/// use armada::registry::{ResourceRegistry, ResourceState, ResourceType};
///
/// let registry = ResourceRegistry::new();
/// let composite = ResourceState::new(ResourceType::CompositeComponent, "app", "app")
///     .with_correlation_id("ctx-1");
/// let container = ResourceState::new(ResourceType::Container, "web", "web")
///     .with_parent(&composite.link);
/// registry.insert(composite.clone()).unwrap();
/// registry.insert(container.clone()).unwrap();
///
/// assert_eq!(registry.children(&composite.link), [container.link.clone()].into());
/// assert_eq!(registry.correlated("ctx-1", None).len(), 1);
/// assert!(registry.insert(container).is_err());
/// ```
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: DashMap<String, ResourceState>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new resource.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidLink`] if the link does not match the
    ///   resource type.
    /// - [`RegistryError::AlreadyExists`] if the link is taken.
    pub fn insert(&self, state: ResourceState) -> Result<(), RegistryError> {
        Self::check_link(&state)?;
        match self.resources.entry(state.link.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists { link: state.link }),
            Entry::Vacant(slot) => {
                tracing::debug!(link = %state.link, resource_type = %state.resource_type, "registered resource");
                slot.insert(state);
                Ok(())
            }
        }
    }

    /// Registers `state` unless its link is already present. Returns
    /// `true` if it was inserted. Handlers re-run after a restart use this
    /// so that a second run does not fail on resources created by the
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidLink`] if the link does not match
    /// the resource type.
    pub fn ensure(&self, state: ResourceState) -> Result<bool, RegistryError> {
        Self::check_link(&state)?;
        match self.resources.entry(state.link.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(true)
            }
        }
    }

    fn check_link(state: &ResourceState) -> Result<(), RegistryError> {
        match ResourceType::from_link(&state.link) {
            Some(t) if t == state.resource_type => Ok(()),
            _ => Err(RegistryError::InvalidLink {
                link: state.link.clone(),
                reason: format!("not a {} link", state.resource_type),
            }),
        }
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown link.
    pub fn get(&self, link: &str) -> Result<ResourceState, RegistryError> {
        self.resources
            .get(link)
            .map(|r| r.value().clone())
            .ok_or_else(|| RegistryError::NotFound {
                link: link.to_string(),
            })
    }

    pub fn contains(&self, link: &str) -> bool {
        self.resources.contains_key(link)
    }

    /// Applies `f` to the stored resource and returns the result.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown link.
    pub fn update<F>(&self, link: &str, f: F) -> Result<ResourceState, RegistryError>
    where
        F: FnOnce(&mut ResourceState),
    {
        let mut entry = self
            .resources
            .get_mut(link)
            .ok_or_else(|| RegistryError::NotFound {
                link: link.to_string(),
            })?;
        f(entry.value_mut());
        Ok(entry.value().clone())
    }

    /// Removes a resource, returning it if it was present.
    pub fn remove(&self, link: &str) -> Option<ResourceState> {
        let removed = self.resources.remove(link).map(|(_, state)| state);
        if removed.is_some() {
            tracing::debug!(link, "removed resource");
        }
        removed
    }

    /// Resources of one type, ordered by link.
    pub fn list(&self, resource_type: ResourceType) -> Vec<ResourceState> {
        let mut found: Vec<ResourceState> = self
            .resources
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.link.cmp(&b.link));
        found
    }

    /// Links of the resources whose parent is `link`.
    pub fn children(&self, link: &str) -> BTreeSet<String> {
        self.resources
            .iter()
            .filter(|r| r.parent_link.as_deref() == Some(link))
            .map(|r| r.key().clone())
            .collect()
    }

    /// Links of the resources carrying `correlation_id`, optionally of one
    /// type.
    pub fn correlated(
        &self,
        correlation_id: &str,
        resource_type: Option<ResourceType>,
    ) -> BTreeSet<String> {
        self.resources
            .iter()
            .filter(|r| r.correlation_id.as_deref() == Some(correlation_id))
            .filter(|r| resource_type.is_none_or(|t| r.resource_type == t))
            .map(|r| r.key().clone())
            .collect()
    }

    /// All registered links.
    pub fn links(&self) -> BTreeSet<String> {
        self.resources.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[async_trait]
impl ResourceQuery for ResourceRegistry {
    async fn query_by_correlation(
        &self,
        correlation_id: &str,
        kind: Option<&str>,
    ) -> Result<BTreeSet<String>, FailureDetail> {
        let resource_type = match kind {
            None => None,
            Some(name) => Some(ResourceType::from_name(name).ok_or_else(|| {
                FailureDetail::validation(format!("unknown resource type {name}"))
            })?),
        };
        Ok(self.correlated(correlation_id, resource_type))
    }

    async fn children_of(&self, link: &str) -> Result<BTreeSet<String>, FailureDetail> {
        Ok(self.children(link))
    }

    async fn delete(&self, link: &str) -> Result<(), FailureDetail> {
        self.remove(link);
        Ok(())
    }
}
