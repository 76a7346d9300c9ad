//! Compensating cleanup.
//!
//! On a rollback or cleanup-only removal, a workflow does not call the
//! forward-path adapters. It asks the [`Compensator`] to find every
//! resource transitively created under the ones it was given, and under
//! the ones carrying its correlation id, and to delete those records,
//! using [`fan_out`](crate::fanout::fan_out) for the bulk delete.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::TaskEngine;
use crate::fanout::fan_out;
use crate::types::failure::FailureDetail;
use crate::types::link::TaskAddress;
use crate::types::update::TaskUpdate;

/// Query side of the persisted resource store.
#[async_trait]
pub trait ResourceQuery: Send + Sync {
    /// Resources carrying `correlation_id`, optionally restricted to one
    /// resource kind.
    async fn query_by_correlation(
        &self,
        correlation_id: &str,
        kind: Option<&str>,
    ) -> Result<BTreeSet<String>, FailureDetail>;

    /// Resources whose parent is `link`.
    async fn children_of(&self, link: &str) -> Result<BTreeSet<String>, FailureDetail>;

    /// Removes the local record of `link`. Removing a missing record
    /// succeeds.
    async fn delete(&self, link: &str) -> Result<(), FailureDetail>;
}

/// Finds and removes resources created under a workflow.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeSet;
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use armada_tasks::compensator::{Compensator, ResourceQuery};
/// use armada_tasks::FailureDetail;
///
/// struct Tree;
///
/// #[async_trait]
/// impl ResourceQuery for Tree {
///     async fn query_by_correlation(&self, _: &str, _: Option<&str>) -> Result<BTreeSet<String>, FailureDetail> {
///         Ok(BTreeSet::new())
///     }
///     async fn children_of(&self, link: &str) -> Result<BTreeSet<String>, FailureDetail> {
///         Ok(match link {
///             "/a" => ["/a/1".to_string(), "/a/2".to_string()].into(),
///             "/a/1" => ["/a/1/x".to_string()].into(),
///             _ => BTreeSet::new(),
///         })
///     }
///     async fn delete(&self, _: &str) -> Result<(), FailureDetail> {
///         Ok(())
///     }
/// }
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let compensator = Compensator::new(Arc::new(Tree));
/// let all = compensator.collect(&["/a".to_string()].into()).await.unwrap();
/// assert_eq!(all.len(), 4);
/// # });
/// ```
pub struct Compensator<Q: ?Sized> {
    query: Arc<Q>,
}

impl<Q: ?Sized> Clone for Compensator<Q> {
    fn clone(&self) -> Self {
        Self {
            query: Arc::clone(&self.query),
        }
    }
}

impl<Q: ResourceQuery + ?Sized + 'static> Compensator<Q> {
    pub fn new(query: Arc<Q>) -> Self {
        Self { query }
    }

    /// `roots` plus all their descendants.
    ///
    /// # Errors
    ///
    /// Returns the first query failure.
    pub async fn collect(&self, roots: &BTreeSet<String>) -> Result<BTreeSet<String>, FailureDetail> {
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = roots.iter().cloned().collect();
        while let Some(link) = queue.pop_front() {
            if !found.insert(link.clone()) {
                continue;
            }
            for child in self.query.children_of(&link).await? {
                if !found.contains(&child) {
                    queue.push_back(child);
                }
            }
        }
        Ok(found)
    }

    /// Everything correlated to `correlation_id`, plus descendants.
    ///
    /// # Errors
    ///
    /// Returns the first query failure.
    pub async fn collect_correlated(
        &self,
        correlation_id: &str,
        kind: Option<&str>,
    ) -> Result<BTreeSet<String>, FailureDetail> {
        let roots = self.query.query_by_correlation(correlation_id, kind).await?;
        self.collect(&roots).await
    }

    /// Deletes every link concurrently and sends `on_complete` with the
    /// deleted links, or fails `owner` with the first delete failure.
    pub fn remove_all<F>(
        &self,
        engine: &TaskEngine,
        owner: TaskAddress,
        links: BTreeSet<String>,
        on_complete: F,
    ) where
        F: FnOnce(Vec<String>) -> TaskUpdate + Send + 'static,
    {
        let operations = links
            .into_iter()
            .map(|link| {
                let query = Arc::clone(&self.query);
                let id = link.clone();
                let op = async move {
                    query.delete(&link).await?;
                    Ok::<_, FailureDetail>(link)
                };
                (id, op)
            })
            .collect();
        fan_out(engine, owner, operations, on_complete);
    }

    /// `roots`, the resources correlated to `correlation_id` and all
    /// their descendants.
    ///
    /// # Errors
    ///
    /// Returns the first query failure.
    pub async fn collect_scope(
        &self,
        roots: &BTreeSet<String>,
        correlation_id: Option<&str>,
    ) -> Result<BTreeSet<String>, FailureDetail> {
        let mut seeds = roots.clone();
        if let Some(correlation_id) = correlation_id {
            seeds.extend(self.query.query_by_correlation(correlation_id, None).await?);
        }
        self.collect(&seeds).await
    }

    /// Collects the scope of `roots` and `correlation_id` and removes all
    /// of it in the background. With no roots and no correlation id it
    /// completes at once without querying.
    pub fn run<F>(
        &self,
        engine: &TaskEngine,
        owner: TaskAddress,
        roots: BTreeSet<String>,
        correlation_id: Option<String>,
        on_complete: F,
    ) where
        F: FnOnce(Vec<String>) -> TaskUpdate + Send + 'static,
    {
        if roots.is_empty() && correlation_id.is_none() {
            tracing::debug!(address = %owner, "nothing to compensate");
            engine.send(on_complete(Vec::new()));
            return;
        }
        let compensator = self.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            match compensator.collect_scope(&roots, correlation_id.as_deref()).await {
                Ok(links) => {
                    tracing::info!(
                        address = %owner,
                        roots = roots.len(),
                        correlation_id = correlation_id.as_deref().unwrap_or("-"),
                        total = links.len(),
                        "removing correlated resources"
                    );
                    compensator.remove_all(&engine, owner, links, on_complete);
                }
                Err(failure) => {
                    tracing::warn!(address = %owner, failure = %failure, "resource query failed");
                    engine.send(TaskUpdate::failed(owner, failure));
                }
            }
        });
    }
}
