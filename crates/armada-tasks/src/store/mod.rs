//! Task persistence.
//!
//! # Architecture
//!
//! Two layers:
//!
//! 1. **[`TaskStore`]** -- typed access to task records: create, get,
//!    compare-and-swap modify, listing, correlation queries and expiry
//!    cleanup. Cheap to clone; shared by the engine and every workflow.
//!
//! 2. **[`StorageBackend`]** -- dumb key-value trait that backends
//!    implement. No domain logic.
//!
//! # Backends
//!
//! - [`InMemoryBackend`](memory::InMemoryBackend) -- `DashMap`, lost on
//!   restart.
//! - [`FileBackend`](file::FileBackend) -- one JSON file per task, survives
//!   restart.
//! - `RedisBackend` -- Redis with Lua-scripted CAS, behind the `redis`
//!   feature flag.

pub mod backend;
pub mod file;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod task_store;

pub use backend::{StorageBackend, StorageError, VersionedRecord};
pub use task_store::TaskStore;

/// Limits applied by [`TaskStore`] regardless of backend.
///
/// # Defaults
///
/// | Setting                 | Default   | Description                              |
/// |-------------------------|-----------|------------------------------------------|
/// | `default_ttl_ms`        | `None`    | Expiry applied when a record has none    |
/// | `max_record_size_bytes` | 1,048,576 | 1 MB per serialized record               |
/// | `max_cas_retries`       | 8         | Re-reads after a lost compare-and-swap   |
///
/// # Examples
///
/// ```
/// use armada_tasks::store::StoreConfig;
///
/// let config = StoreConfig::default();
/// assert_eq!(config.default_ttl_ms, None);
/// assert_eq!(config.max_record_size_bytes, 1_048_576);
/// assert_eq!(config.max_cas_retries, 8);
///
/// let custom = StoreConfig {
///     default_ttl_ms: Some(86_400_000), // 24 hours
///     ..StoreConfig::default()
/// };
/// assert_eq!(custom.default_ttl_ms, Some(86_400_000));
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Expiry in milliseconds for records created without one. `None`
    /// means records never expire by default.
    pub default_ttl_ms: Option<u64>,

    /// Writes of larger serialized records fail with
    /// [`TaskError::StorageFull`](crate::TaskError::StorageFull).
    pub max_record_size_bytes: usize,

    /// How many times a modification is re-applied after losing a
    /// compare-and-swap race before surfacing
    /// [`TaskError::ConcurrentModification`](crate::TaskError::ConcurrentModification).
    pub max_cas_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: None,
            max_record_size_bytes: 1_048_576, // 1 MB
            max_cas_retries: 8,
        }
    }
}
