//! In-memory storage backend.
//!
//! [`InMemoryBackend`] keeps `(bytes, version)` pairs in a [`DashMap`].
//! It does not survive a restart; use it for tests and single-process
//! deployments that accept losing in-flight tasks.
//!
//! # Examples
//!
//! ```
//! use armada_tasks::store::memory::InMemoryBackend;
//! use armada_tasks::store::TaskStore;
//!
//! let store = TaskStore::new(InMemoryBackend::new());
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

/// Thread-safe in-memory storage backend.
///
/// Shard-level locking in `DashMap` makes `put_if_version` atomic per key.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: DashMap<String, (Vec<u8>, u64)>,
    max_records: Option<usize>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects inserts of new keys beyond `max` records.
    ///
    /// # Examples
    ///
    /// ```
    /// use armada_tasks::store::memory::InMemoryBackend;
    ///
    /// let backend = InMemoryBackend::new().with_max_records(100);
    /// assert!(backend.is_empty());
    /// ```
    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = Some(max);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check_capacity(&self) -> Result<(), StorageError> {
        match self.max_records {
            Some(max) if self.data.len() >= max => Err(StorageError::CapacityExceeded {
                message: format!("max {max} records"),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let entry = self.data.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        let (data, version) = entry.value();
        Ok(VersionedRecord {
            data: data.clone(),
            version: *version,
        })
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        if !self.data.contains_key(key) {
            self.check_capacity()?;
        }
        let mut entry = self.data.entry(key.to_string()).or_insert((Vec::new(), 0));
        let version = entry.value().1 + 1;
        *entry.value_mut() = (data.to_vec(), version);
        Ok(version)
    }

    async fn insert_new(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        self.check_capacity()?;
        match self.data.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists {
                key: key.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert((data.to_vec(), 1));
                Ok(1)
            }
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let mut entry = self
            .data
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        let current_version = entry.value().1;
        if current_version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current_version,
            });
        }
        let new_version = current_version + 1;
        *entry.value_mut() = (data.to_vec(), new_version);
        Ok(new_version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| {
                let (data, version) = entry.value();
                (
                    entry.key().clone(),
                    VersionedRecord {
                        data: data.clone(),
                        version: *version,
                    },
                )
            })
            .collect())
    }
}
