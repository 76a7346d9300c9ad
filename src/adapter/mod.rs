//! Boundary to the provisioning adapters.
//!
//! Workflows never speak a provider protocol themselves. They build an
//! [`AdapterRequest`] and hand it to an [`Adapter`] handle injected at
//! construction time. There are two ways to call one:
//!
//! - [`Adapter::execute`] returns the outcome to the caller, which wraps it
//!   in a retry or a fan-out and reports back to its own task.
//! - [`submit`] returns at once; the adapter later delivers exactly one
//!   terminal update to the task named by the request's callback.

pub mod scripted;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use armada_tasks::engine::TaskEngine;
use armada_tasks::retry::{invoke_with_retry, RetryError, RetryPolicy};
use armada_tasks::{FailureDetail, TaskLink, TaskStage, TaskUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

pub use scripted::ScriptedAdapter;

/// What the adapter is asked to do with the referenced resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterOperation {
    Create,
    Delete,
    Apply,
    /// Read-only call that checks a new host answers.
    Validate,
}

impl fmt::Display for AdapterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Apply => write!(f, "APPLY"),
            Self::Validate => write!(f, "VALIDATE"),
        }
    }
}

/// One request to an adapter.
///
/// # Examples
///
/// ```
/// use armada::adapter::{AdapterOperation, AdapterRequest};
///
/// let request = AdapterRequest::new("/resources/compute/a", AdapterOperation::Create)
///     .with_custom_property("__contextId", "ctx-1");
/// assert_eq!(request.operation, AdapterOperation::Create);
/// assert!(request.callback.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterRequest {
    pub resource_reference: String,
    pub operation: AdapterOperation,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    /// Task to notify when the request was handed over with [`submit`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<TaskLink>,
}

impl AdapterRequest {
    pub fn new(resource_reference: impl Into<String>, operation: AdapterOperation) -> Self {
        Self {
            resource_reference: resource_reference.into(),
            operation,
            custom_properties: BTreeMap::new(),
            callback: None,
        }
    }

    pub fn with_custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_custom_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.custom_properties.extend(properties);
        self
    }

    pub fn with_callback(mut self, callback: TaskLink) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// Successful outcome of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResponse {
    /// Resources created or touched by the request.
    #[serde(default)]
    pub resource_links: BTreeSet<String>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

impl AdapterResponse {
    pub fn with_resource_link(mut self, link: impl Into<String>) -> Self {
        self.resource_links.insert(link.into());
        self
    }

    pub fn with_custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }
}

/// Client for one provisioning backend.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short name used in logs and failure messages.
    fn name(&self) -> &str;

    /// Performs the request and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the adapter error; [`AdapterError::is_retryable`] tells the
    /// caller whether another attempt may succeed.
    async fn execute(&self, request: &AdapterRequest) -> Result<AdapterResponse, AdapterError>;
}

/// Hands `request` to `adapter` and returns at once.
///
/// The adapter runs in the background and delivers exactly one update to
/// the callback's parent: the finish target with the response's links and
/// properties, or the fail target with the error as failure detail.
///
/// # Errors
///
/// Returns [`AdapterError::MissingCallback`] if the request carries no
/// callback; nothing is started in that case.
pub fn submit(
    adapter: Arc<dyn Adapter>,
    engine: &TaskEngine,
    request: AdapterRequest,
) -> Result<(), AdapterError> {
    let Some(callback) = request.callback.clone() else {
        return Err(AdapterError::MissingCallback {
            reference: request.resource_reference,
        });
    };
    let engine = engine.clone();
    tracing::debug!(
        adapter = adapter.name(),
        operation = %request.operation,
        reference = %request.resource_reference,
        parent = %callback.parent,
        "submitted adapter request"
    );
    tokio::spawn(async move {
        let source = format!("{}:{}", adapter.name(), request.resource_reference);
        let update = match adapter.execute(&request).await {
            Ok(response) => {
                TaskUpdate::to_target(callback.parent.clone(), callback.target_for(TaskStage::Finished))
                    .with_resource_links(response.resource_links)
                    .with_custom_properties(response.custom_properties)
            }
            Err(e) => {
                tracing::warn!(adapter = adapter.name(), reference = %request.resource_reference, error = %e, "adapter request failed");
                TaskUpdate::to_target(callback.parent.clone(), callback.target_for(TaskStage::Failed))
                    .with_failure(e.to_failure().with_source(source.clone()))
            }
        };
        engine.send(update.with_source(source));
    });
    Ok(())
}

/// Calls `adapter` under `policy` until it succeeds or gives up.
///
/// # Errors
///
/// Returns the last adapter error as failure detail: `RETRY_EXHAUSTED`
/// when the budget ran out, `REMOTE` for a final rejection.
pub async fn execute_with_retry(
    adapter: Arc<dyn Adapter>,
    request: AdapterRequest,
    policy: RetryPolicy,
) -> Result<AdapterResponse, FailureDetail> {
    let operation = format!("{} {}", request.operation, request.resource_reference);
    invoke_with_retry(&operation, &policy, |_attempt| {
        let adapter = Arc::clone(&adapter);
        let request = request.clone();
        async move { adapter.execute(&request).await }
    })
    .await
    .map_err(RetryError::into_failure)
}
