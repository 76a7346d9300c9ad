//! In-process adapter with scripted outcomes.
//!
//! Stands in for a provider in demos and tests. Every request succeeds
//! unless a failure was scripted for its `(operation, reference)` pair.
//! Successful `CREATE` and `APPLY` requests answer with the reference as
//! resource link.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::adapter::{Adapter, AdapterOperation, AdapterRequest, AdapterResponse};
use crate::error::AdapterError;

type Key = (AdapterOperation, String);

/// Scripted adapter; see the module docs.
///
/// # Examples
///
/// ```
/// use armada::adapter::{Adapter, AdapterOperation, AdapterRequest, ScriptedAdapter};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let adapter = ScriptedAdapter::new("docker");
/// adapter.fail_times(AdapterOperation::Create, "/resources/compute/a", 1, ScriptedAdapter::unavailable("/resources/compute/a"));
///
/// let request = AdapterRequest::new("/resources/compute/a", AdapterOperation::Create);
/// assert!(adapter.execute(&request).await.is_err());
/// let response = adapter.execute(&request).await.unwrap();
/// assert!(response.resource_links.contains("/resources/compute/a"));
/// assert_eq!(adapter.call_count(AdapterOperation::Create), 2);
/// # });
/// ```
#[derive(Debug)]
pub struct ScriptedAdapter {
    name: String,
    latency: Duration,
    failures: DashMap<Key, VecDeque<AdapterError>>,
    permanent: DashMap<Key, AdapterError>,
    responses: DashMap<Key, AdapterResponse>,
    calls: Mutex<Vec<AdapterRequest>>,
}

impl ScriptedAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            failures: DashMap::new(),
            permanent: DashMap::new(),
            responses: DashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Delay applied before every answer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The next `times` requests for `(operation, reference)` fail with
    /// `error`; later ones succeed.
    pub fn fail_times(
        &self,
        operation: AdapterOperation,
        reference: &str,
        times: usize,
        error: AdapterError,
    ) {
        let mut queue = self
            .failures
            .entry((operation, reference.to_string()))
            .or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Every request for `(operation, reference)` fails with `error`.
    pub fn fail_always(&self, operation: AdapterOperation, reference: &str, error: AdapterError) {
        self.permanent.insert((operation, reference.to_string()), error);
    }

    /// Successful requests for `(operation, reference)` answer with
    /// `response`.
    pub fn respond_with(&self, operation: AdapterOperation, reference: &str, response: AdapterResponse) {
        self.responses.insert((operation, reference.to_string()), response);
    }

    /// A retryable error for `reference`.
    pub fn unavailable(reference: &str) -> AdapterError {
        AdapterError::Unavailable {
            adapter: "scripted".to_string(),
            reference: reference.to_string(),
            message: "connection refused".to_string(),
        }
    }

    /// A final error with `status` for `reference`.
    pub fn rejected(reference: &str, status: u16) -> AdapterError {
        AdapterError::Rejected {
            adapter: "scripted".to_string(),
            reference: reference.to_string(),
            status,
            message: "request rejected".to_string(),
        }
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<AdapterRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, operation: AdapterOperation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.operation == operation)
            .count()
    }

    /// Number of requests per `(operation, reference)`.
    pub fn calls_by_reference(&self) -> BTreeMap<(AdapterOperation, String), usize> {
        let mut counts = BTreeMap::new();
        for request in self.calls.lock().iter() {
            *counts
                .entry((request.operation, request.resource_reference.clone()))
                .or_insert(0) += 1;
        }
        counts
    }

    fn scripted_failure(&self, key: &Key) -> Option<AdapterError> {
        if let Some(error) = self.permanent.get(key) {
            return Some(error.value().clone());
        }
        self.failures.get_mut(key).and_then(|mut queue| queue.pop_front())
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &AdapterRequest) -> Result<AdapterResponse, AdapterError> {
        self.calls.lock().push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let key = (request.operation, request.resource_reference.clone());
        if let Some(error) = self.scripted_failure(&key) {
            tracing::debug!(adapter = %self.name, operation = %request.operation, reference = %request.resource_reference, "scripted failure");
            return Err(error);
        }
        if let Some(response) = self.responses.get(&key) {
            return Ok(response.value().clone());
        }
        Ok(match request.operation {
            AdapterOperation::Create | AdapterOperation::Apply => {
                AdapterResponse::default().with_resource_link(&request.resource_reference)
            }
            AdapterOperation::Delete | AdapterOperation::Validate => AdapterResponse::default(),
        })
    }
}
