//! Typed task store on top of any [`StorageBackend`].
//!
//! [`TaskStore`] owns serialization, size limits, default expiry and the
//! compare-and-swap retry loop. Backends stay dumb key-value stores.
//!
//! # CAS Semantics
//!
//! [`modify`](TaskStore::modify) reads the record, applies a closure and
//! writes with [`StorageBackend::put_if_version`]. On a version conflict
//! the record is re-read and the closure re-applied, up to
//! [`StoreConfig::max_cas_retries`] times.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::domain::record::{TaskBody, TaskHeader, TaskRecord};
use crate::error::TaskError;
use crate::store::backend::{make_prefix, StorageBackend, StorageError, VersionedRecord};
use crate::store::StoreConfig;
use crate::types::link::TaskAddress;
use crate::types::sub_stage::SubStage;

/// Shared handle to the persisted task records.
///
/// # Examples
///
/// ```
/// use armada_tasks::domain::{NoBody, TaskRecord, TaskRequest};
/// use armada_tasks::store::memory::InMemoryBackend;
/// use armada_tasks::store::TaskStore;
/// use armada_tasks::{DefaultSubStage, TaskAddress};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let store = TaskStore::new(InMemoryBackend::new());
/// let address = TaskAddress::new("counter", "1");
/// let mut record: TaskRecord<DefaultSubStage, NoBody> =
///     TaskRecord::new(address.clone(), TaskRequest::new(NoBody {}));
/// store.create(&mut record).await.unwrap();
///
/// let loaded: TaskRecord<DefaultSubStage, NoBody> = store.get(&address).await.unwrap();
/// assert_eq!(loaded.version, 1);
/// # });
/// ```
#[derive(Clone)]
pub struct TaskStore {
    backend: Arc<dyn StorageBackend>,
    config: StoreConfig,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    pub fn new(backend: impl StorageBackend + 'static) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    /// Wraps an already shared backend.
    pub fn from_arc(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            config: StoreConfig::default(),
        }
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ---- Serialization helpers (private) ----

    fn serialize<T: serde::Serialize>(&self, value: &T, address: &str) -> Result<Vec<u8>, TaskError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| TaskError::StoreError(format!("failed to serialize {address}: {e}")))?;
        if bytes.len() > self.config.max_record_size_bytes {
            return Err(TaskError::StorageFull {
                message: format!(
                    "record {address} is {} bytes, limit is {}",
                    bytes.len(),
                    self.config.max_record_size_bytes
                ),
            });
        }
        Ok(bytes)
    }

    fn deserialize_record<S: SubStage, B: TaskBody>(
        versioned: &VersionedRecord,
        address: &str,
    ) -> Result<TaskRecord<S, B>, TaskError> {
        let mut record: TaskRecord<S, B> = serde_json::from_slice(&versioned.data)
            .map_err(|e| TaskError::StoreError(format!("failed to deserialize {address}: {e}")))?;
        record.version = versioned.version;
        Ok(record)
    }

    fn deserialize_header(versioned: &VersionedRecord, key: &str) -> Result<TaskHeader, TaskError> {
        let mut header: TaskHeader = serde_json::from_slice(&versioned.data)
            .map_err(|e| TaskError::StoreError(format!("failed to deserialize {key}: {e}")))?;
        header.version = versioned.version;
        Ok(header)
    }

    fn map_storage_error(err: StorageError, address: &str) -> TaskError {
        match err {
            StorageError::NotFound { .. } => TaskError::NotFound {
                address: address.to_string(),
            },
            StorageError::AlreadyExists { .. } => TaskError::AlreadyExists {
                address: address.to_string(),
            },
            StorageError::VersionConflict {
                expected, actual, ..
            } => TaskError::ConcurrentModification {
                address: address.to_string(),
                expected_version: expected,
                actual_version: actual,
            },
            StorageError::CapacityExceeded { message } => TaskError::StorageFull { message },
            StorageError::Backend { message, .. } => TaskError::StoreError(message),
        }
    }

    // ---- Record operations (public) ----

    /// Persists a new record at version 1.
    ///
    /// Applies [`StoreConfig::default_ttl_ms`] when the record has no
    /// expiry.
    ///
    /// # Errors
    ///
    /// - [`TaskError::AlreadyExists`] if the address is taken.
    /// - [`TaskError::StorageFull`] if the record or backend is over limit.
    pub async fn create<S: SubStage, B: TaskBody>(
        &self,
        record: &mut TaskRecord<S, B>,
    ) -> Result<(), TaskError> {
        if record.expires_at.is_none() {
            if let Some(ttl) = self.config.default_ttl_ms.and_then(|ms| i64::try_from(ms).ok()) {
                record.expires_at = Duration::try_milliseconds(ttl)
                    .and_then(|ttl| record.created_at.checked_add_signed(ttl));
            }
        }
        let address = record.address.as_str();
        let bytes = self.serialize(record, address)?;
        record.version = self
            .backend
            .insert_new(address, &bytes)
            .await
            .map_err(|e| Self::map_storage_error(e, address))?;
        Ok(())
    }

    /// Loads a typed record.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] if nothing is stored at `address`.
    /// - [`TaskError::StoreError`] if the document does not match `S`/`B`.
    pub async fn get<S: SubStage, B: TaskBody>(
        &self,
        address: &TaskAddress,
    ) -> Result<TaskRecord<S, B>, TaskError> {
        let versioned = self
            .backend
            .get(address.as_str())
            .await
            .map_err(|e| Self::map_storage_error(e, address.as_str()))?;
        Self::deserialize_record(&versioned, address.as_str())
    }

    /// Loads the workflow-independent part of a record.
    pub async fn header(&self, address: &TaskAddress) -> Result<TaskHeader, TaskError> {
        let versioned = self
            .backend
            .get(address.as_str())
            .await
            .map_err(|e| Self::map_storage_error(e, address.as_str()))?;
        Self::deserialize_header(&versioned, address.as_str())
    }

    /// Read-modify-write with compare-and-swap.
    ///
    /// `apply` returns `Ok(true)` to write the changed record, `Ok(false)`
    /// to leave storage untouched. It may run more than once when
    /// concurrent writers race, so it must only depend on the record it is
    /// given. Returns the resulting record and whether it was written.
    ///
    /// # Errors
    ///
    /// - Any error returned by `apply`, unchanged.
    /// - [`TaskError::ConcurrentModification`] after
    ///   [`StoreConfig::max_cas_retries`] lost races.
    pub async fn modify<S, B, F>(
        &self,
        address: &TaskAddress,
        mut apply: F,
    ) -> Result<(TaskRecord<S, B>, bool), TaskError>
    where
        S: SubStage,
        B: TaskBody,
        F: FnMut(&mut TaskRecord<S, B>) -> Result<bool, TaskError>,
    {
        let mut attempt = 0;
        loop {
            let mut record: TaskRecord<S, B> = self.get(address).await?;
            if !apply(&mut record)? {
                return Ok((record, false));
            }
            let bytes = self.serialize(&record, address.as_str())?;
            match self
                .backend
                .put_if_version(address.as_str(), &bytes, record.version)
                .await
            {
                Ok(version) => {
                    record.version = version;
                    return Ok((record, true));
                }
                Err(StorageError::VersionConflict {
                    expected, actual, ..
                }) if attempt < self.config.max_cas_retries => {
                    attempt += 1;
                    tracing::debug!(
                        address = %address,
                        expected,
                        actual,
                        attempt,
                        "lost compare-and-swap, re-reading record"
                    );
                }
                Err(e) => return Err(Self::map_storage_error(e, address.as_str())),
            }
        }
    }

    /// Removes a record. Returns `false` if it did not exist.
    pub async fn delete(&self, address: &TaskAddress) -> Result<bool, TaskError> {
        self.backend
            .delete(address.as_str())
            .await
            .map_err(|e| Self::map_storage_error(e, address.as_str()))
    }

    /// Headers of every task of one workflow kind, oldest first.
    pub async fn list(&self, workflow: &str) -> Result<Vec<TaskHeader>, TaskError> {
        self.list_prefix(&make_prefix(workflow)).await
    }

    /// Headers of every stored task, oldest first.
    pub async fn list_all(&self) -> Result<Vec<TaskHeader>, TaskError> {
        self.list_prefix("").await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<TaskHeader>, TaskError> {
        let entries = self
            .backend
            .list_by_prefix(prefix)
            .await
            .map_err(|e| Self::map_storage_error(e, prefix))?;

        let mut headers: Vec<TaskHeader> = entries
            .iter()
            .filter_map(|(key, versioned)| match Self::deserialize_header(versioned, key) {
                Ok(header) => Some(header),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable task record");
                    None
                }
            })
            .collect();
        headers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(headers)
    }

    /// Headers of every task sharing `correlation_id`.
    pub async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<TaskHeader>, TaskError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|h| h.context_id() == Some(correlation_id))
            .collect())
    }

    /// Deletes terminal records whose expiry has passed.
    ///
    /// Non-terminal expired records are left for
    /// [`TaskEngine::expire_overdue`](crate::engine::TaskEngine::expire_overdue),
    /// which fails them and notifies their parents first.
    pub async fn cleanup_expired(&self) -> Result<usize, TaskError> {
        let now = Utc::now();
        let mut removed = 0;
        for header in self.list_all().await? {
            let expired = header.expires_at.is_some_and(|at| now >= at);
            if expired && header.is_terminal() && self.delete(&header.address).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "removed expired task records");
        }
        Ok(removed)
    }
}
