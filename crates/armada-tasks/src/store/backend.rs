//! Low-level key-value storage backend trait and supporting types.
//!
//! [`StorageBackend`] is the contract every storage engine implements:
//! [`get`](StorageBackend::get), [`put`](StorageBackend::put),
//! [`insert_new`](StorageBackend::insert_new),
//! [`put_if_version`](StorageBackend::put_if_version),
//! [`delete`](StorageBackend::delete) and
//! [`list_by_prefix`](StorageBackend::list_by_prefix).
//!
//! Backends store opaque bytes. Transition rules, merging, expiry and
//! serialization live in [`TaskStore`](crate::store::TaskStore).
//!
//! # Key Structure
//!
//! Keys are task addresses, `{workflow}:{task_id}`. Workflow kinds contain
//! no colon, so `{workflow}:` is a prefix that lists one workflow's tasks
//! and the empty prefix lists everything.
//!
//! # Versioning
//!
//! Each record carries a monotonic `u64` version starting at 1 and
//! incremented on every successful write.
//! [`put_if_version`](StorageBackend::put_if_version) is the
//! compare-and-swap primitive behind every task mutation.

use std::fmt;

use async_trait::async_trait;

/// A stored record paired with its version number.
///
/// # Examples
///
/// ```
/// use armada_tasks::store::backend::VersionedRecord;
///
/// let record = VersionedRecord { data: b"{}".to_vec(), version: 1 };
/// assert_eq!(record.version, 1);
/// ```
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// Serialized task document (JSON).
    pub data: Vec<u8>,

    /// Starts at 1, increments on each successful write.
    pub version: u64,
}

/// Errors raised by raw storage operations.
///
/// [`TaskStore`](crate::store::TaskStore) maps these to
/// [`TaskError`](crate::error::TaskError) before they reach callers.
///
/// # Examples
///
/// ```
/// use armada_tasks::store::backend::StorageError;
///
/// let err = StorageError::VersionConflict {
///     key: "counter:1".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// The requested key was not found.
    NotFound {
        /// The missing key.
        key: String,
    },

    /// [`insert_new`](StorageBackend::insert_new) found an existing key.
    AlreadyExists {
        /// The existing key.
        key: String,
    },

    /// The stored version does not match the expected one.
    VersionConflict {
        /// The contended key.
        key: String,
        /// The version the caller read.
        expected: u64,
        /// The version found in storage (0 if the key vanished).
        actual: u64,
    },

    /// The backend has reached a capacity limit.
    CapacityExceeded {
        /// Description of the limit.
        message: String,
    },

    /// I/O or backend-specific failure.
    Backend {
        /// Description of the failure.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StorageError {
    /// Wraps an underlying error as [`StorageError::Backend`].
    pub fn backend(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::AlreadyExists { key } => write!(f, "key already exists: {key}"),
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on key {key}: expected {expected}, found {actual}"
            ),
            Self::CapacityExceeded { message } => write!(f, "capacity exceeded: {message}"),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Key-value storage backend for task persistence.
///
/// Implementations must be `Send + Sync`; the engine calls them from many
/// mailboxes at once. Backends never interpret the bytes they store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a record and its version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key does not exist.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Stores a record unconditionally and returns the new version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::CapacityExceeded`] if the backend is full.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Stores a record only if the key does not exist yet (version 1).
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if the key exists.
    /// - [`StorageError::CapacityExceeded`] if the backend is full.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn insert_new(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Stores a record only if its current version is `expected_version`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key does not exist.
    /// - [`StorageError::VersionConflict`] on a version mismatch.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Deletes a record. Returns `false` if the key did not exist.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O failures.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists every record whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O failures.
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError>;
}

/// Prefix listing all tasks of one workflow kind.
///
/// # Examples
///
/// ```
/// use armada_tasks::store::backend::make_prefix;
///
/// assert_eq!(make_prefix("counter"), "counter:");
/// ```
pub fn make_prefix(workflow: &str) -> String {
    format!("{workflow}:")
}
