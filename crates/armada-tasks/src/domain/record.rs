//! Task record -- the durable state of one workflow instance.
//!
//! [`TaskRecord`] is generic over the workflow's sub-stage enum and body
//! type, and serializes to a single JSON document. [`TaskHeader`] reads the
//! workflow-independent part of the same document, which is what the store
//! needs for listing, correlation queries and recovery.
//!
//! Merging is explicit: [`TaskRecord::merge_update`] applies one update
//! field by field and [`TaskBody::merge`] does the same for the
//! workflow-specific body.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::CONTEXT_ID_KEY;
use crate::types::failure::FailureDetail;
use crate::types::link::{TaskAddress, TaskLink};
use crate::types::stage::TaskStage;
use crate::types::sub_stage::{by_name, SubStage};
use crate::types::update::TaskUpdate;

/// Workflow-specific state stored next to the common record fields.
///
/// Bodies are deserialized from partial JSON patches, so every field
/// should tolerate absence (`#[serde(default)]`). `merge` decides per
/// field whether the patch overwrites (scalars), merges key-wise (maps)
/// or unions (accumulating sets).
pub trait TaskBody:
    Default + Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Folds `patch` into `self`.
    fn merge(&mut self, patch: Self);

    /// Checks fields that must be present before the first transition.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first missing field.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Body for workflows without workflow-specific fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoBody {}

impl TaskBody for NoBody {
    fn merge(&mut self, _patch: Self) {}
}

/// Overwrites `target` when `patch` holds a value.
pub fn overwrite_if_some<T>(target: &mut Option<T>, patch: Option<T>) {
    if patch.is_some() {
        *target = patch;
    }
}

/// Progress of the single notification a child owes its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    /// No parent, or the task is not terminal yet.
    #[default]
    NotRequired,
    /// Terminal; the parent update has not been confirmed sent.
    Pending,
    /// The parent update was sent.
    Delivered,
}

/// Log level for a task's own transition messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLogLevel {
    #[default]
    Info,
    Debug,
}

/// Durable state of one workflow instance.
///
/// A record is only ever changed by merging an update addressed to it;
/// the engine performs that merge under a per-address mailbox and writes
/// the result with compare-and-swap.
///
/// # Examples
///
/// ```
/// use armada_tasks::domain::{NoBody, TaskRecord, TaskRequest};
/// use armada_tasks::{DefaultSubStage, TaskAddress, TaskStage};
///
/// let record: TaskRecord<DefaultSubStage, NoBody> = TaskRecord::new(
///     TaskAddress::new("counter", "1"),
///     TaskRequest::new(NoBody {}).with_resource_count(2),
/// );
/// assert_eq!(record.stage, TaskStage::Created);
/// assert_eq!(record.sub_stage, DefaultSubStage::Created);
/// assert_eq!(record.resource_count, Some(2));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    rename_all = "camelCase",
    bound(serialize = "B: Serialize", deserialize = "B: DeserializeOwned")
)]
pub struct TaskRecord<S: SubStage, B> {
    pub address: TaskAddress,
    pub workflow: String,
    pub stage: TaskStage,
    #[serde(with = "by_name")]
    pub sub_stage: S,
    #[serde(default)]
    pub resource_links: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_description_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_count: Option<u64>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub tenant_links: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<TaskLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    #[serde(default)]
    pub notification: Notification,
    #[serde(default)]
    pub log_level: TaskLogLevel,
    pub body: B,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// CAS version from the store. Not part of the stored document.
    #[serde(skip)]
    pub version: u64,
}

impl<S: SubStage, B: TaskBody> TaskRecord<S, B> {
    /// Builds a `CREATED` record from a creation request.
    pub fn new(address: TaskAddress, request: TaskRequest<B>) -> Self {
        let now = Utc::now();
        // Oversized TTLs are treated as "never expires".
        let expires_at = request.ttl_ms.and_then(|ms| {
            let ms = i64::try_from(ms).ok()?;
            now.checked_add_signed(Duration::try_milliseconds(ms)?)
        });
        Self {
            workflow: address.workflow().to_string(),
            address,
            stage: TaskStage::Created,
            sub_stage: S::CREATED,
            resource_links: request.resource_links,
            resource_description_link: request.resource_description_link,
            resource_count: request.resource_count,
            custom_properties: request.custom_properties,
            tenant_links: request.tenant_links,
            callback: request.callback,
            correlation_id: request.correlation_id,
            failure: None,
            notification: Notification::NotRequired,
            log_level: request.log_level,
            body: request.body,
            created_at: now,
            updated_at: now,
            expires_at,
            version: 0,
        }
    }

    /// Applies one accepted update: moves to `(stage, sub_stage)` and
    /// merges the payload.
    ///
    /// Links are unioned, custom properties merged key-wise, a failure
    /// overwrites the previous one, and the body patch goes through
    /// [`TaskBody::merge`]. Applying the same update twice leaves the
    /// record as after the first application.
    pub fn merge_update(
        &mut self,
        stage: TaskStage,
        sub_stage: S,
        update: &TaskUpdate,
        body_patch: Option<B>,
    ) {
        self.stage = stage;
        self.sub_stage = sub_stage;
        self.resource_links
            .extend(update.resource_links.iter().cloned());
        self.custom_properties.extend(
            update
                .custom_properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if let Some(failure) = &update.failure {
            self.failure = Some(failure.clone());
        }
        if let Some(patch) = body_patch {
            self.body.merge(patch);
        }
        self.updated_at = Utc::now();
    }

    /// Returns `true` once the task reached a terminal stage.
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Returns `true` if the record carries an expiry time in the past.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    /// Correlation id: the explicit one, else the `__contextId` property.
    pub fn context_id(&self) -> Option<&str> {
        self.correlation_id
            .as_deref()
            .or_else(|| self.custom_properties.get(CONTEXT_ID_KEY).map(String::as_str))
    }

    /// `STAGE(SUB_STAGE)` for log messages.
    pub fn describe(&self) -> String {
        format!("{}({})", self.stage, self.sub_stage.name())
    }

    /// Workflow-independent view of this record.
    pub fn header(&self) -> TaskHeader {
        TaskHeader {
            address: self.address.clone(),
            workflow: self.workflow.clone(),
            stage: self.stage,
            sub_stage: self.sub_stage.name().to_string(),
            resource_links: self.resource_links.clone(),
            custom_properties: self.custom_properties.clone(),
            callback: self.callback.clone(),
            correlation_id: self.correlation_id.clone(),
            failure: self.failure.clone(),
            notification: self.notification,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            version: self.version,
        }
    }

    /// Request-tracker view of this record.
    pub fn status(&self, phase: &str) -> TaskStatusView {
        TaskStatusView {
            phase: phase.to_string(),
            stage: self.stage,
            sub_stage: self.sub_stage.name().to_string(),
            progress: if self.stage == TaskStage::Finished {
                100
            } else {
                self.sub_stage.progress()
            },
            resource_links: self.resource_links.clone(),
            failure: self.failure.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// The workflow-independent fields of a stored record.
///
/// Deserialized from the same document as [`TaskRecord`]; unknown fields
/// (the body) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHeader {
    pub address: TaskAddress,
    pub workflow: String,
    pub stage: TaskStage,
    pub sub_stage: String,
    #[serde(default)]
    pub resource_links: BTreeSet<String>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub callback: Option<TaskLink>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureDetail>,
    #[serde(default)]
    pub notification: Notification,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub version: u64,
}

impl TaskHeader {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    /// Correlation id: the explicit one, else the `__contextId` property.
    pub fn context_id(&self) -> Option<&str> {
        self.correlation_id
            .as_deref()
            .or_else(|| self.custom_properties.get(CONTEXT_ID_KEY).map(String::as_str))
    }

    pub fn describe(&self) -> String {
        format!("{}({})", self.stage, self.sub_stage)
    }
}

/// Status document published for request tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    /// Display name of the workflow.
    pub phase: String,
    pub stage: TaskStage,
    pub sub_stage: String,
    /// 0..=100
    pub progress: u8,
    pub resource_links: BTreeSet<String>,
    pub failure: Option<FailureDetail>,
    pub updated_at: DateTime<Utc>,
}

/// Creation request for a task of any workflow.
///
/// # Examples
///
/// ```
/// use armada_tasks::domain::{NoBody, TaskRequest};
///
/// let request = TaskRequest::new(NoBody {})
///     .with_resource_count(3)
///     .with_custom_property("owner", "ops")
///     .with_correlation_id("ctx-42");
/// assert_eq!(request.resource_count, Some(3));
/// assert_eq!(request.custom_properties["owner"], "ops");
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskRequest<B> {
    /// Explicit task id; a random one is generated when absent. Starting
    /// the same id twice is idempotent.
    pub id: Option<String>,
    pub resource_links: BTreeSet<String>,
    pub resource_description_link: Option<String>,
    pub resource_count: Option<u64>,
    pub custom_properties: BTreeMap<String, String>,
    pub tenant_links: BTreeSet<String>,
    pub callback: Option<TaskLink>,
    pub correlation_id: Option<String>,
    pub ttl_ms: Option<u64>,
    pub log_level: TaskLogLevel,
    pub body: B,
}

impl<B> TaskRequest<B> {
    pub fn new(body: B) -> Self {
        Self {
            id: None,
            resource_links: BTreeSet::new(),
            resource_description_link: None,
            resource_count: None,
            custom_properties: BTreeMap::new(),
            tenant_links: BTreeSet::new(),
            callback: None,
            correlation_id: None,
            ttl_ms: None,
            log_level: TaskLogLevel::Info,
            body,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_resource_links<I, L>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.resource_links.extend(links.into_iter().map(Into::into));
        self
    }

    pub fn with_resource_description_link(mut self, link: impl Into<String>) -> Self {
        self.resource_description_link = Some(link.into());
        self
    }

    pub fn with_resource_count(mut self, count: u64) -> Self {
        self.resource_count = Some(count);
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

    pub fn with_tenant_link(mut self, link: impl Into<String>) -> Self {
        self.tenant_links.insert(link.into());
        self
    }

    pub fn with_tenant_links(mut self, links: BTreeSet<String>) -> Self {
        self.tenant_links.extend(links);
        self
    }

    pub fn with_callback(mut self, link: crate::types::link::TaskLink) -> Self {
        self.callback = Some(link);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_log_level(mut self, level: TaskLogLevel) -> Self {
        self.log_level = level;
        self
    }
}
