//! Redis storage backend for task persistence.
//!
//! [`RedisBackend`] implements [`StorageBackend`] on Redis. Reads use
//! `HGETALL`; every write is a Lua script (`redis::Script`) that updates the
//! record hash and its indexes in one round-trip.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:tasks:{workflow}:{task_id}` | Hash | Task record storage |
//! | `{prefix}:idx:{workflow}` | Sorted Set | Per-workflow task index |
//! | `{prefix}:workflows` | Set | Workflow kinds with at least one task |
//!
//! Each task hash has two fields:
//!
//! | Field | Type | Description |
//! |-------|------|-------------|
//! | `version` | String (u64) | Monotonic CAS version, starts at 1 |
//! | `data` | String (JSON) | Serialized task record |
//!
//! Records are never given a Redis TTL. Expired tasks must stay visible so
//! the engine can fail them and notify their parents before
//! [`TaskStore::cleanup_expired`](crate::store::TaskStore::cleanup_expired)
//! deletes them.
//!
//! # Usage
//!
//! ```rust,no_run
//! use armada_tasks::store::redis::RedisBackend;
//! use armada_tasks::store::TaskStore;
//!
//! # async fn example() {
//! let backend = RedisBackend::new("redis://127.0.0.1:6379").await.unwrap();
//! let store = TaskStore::new(backend);
//! # }
//! ```

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

// ---------------------------------------------------------------------------
// Lua script constants
// ---------------------------------------------------------------------------

/// Unconditional put.
///
/// KEYS[1] = task hash, KEYS[2] = workflow index, KEYS[3] = workflow set.
/// ARGV[1] = data, ARGV[2] = task_id, ARGV[3] = creation score,
/// ARGV[4] = workflow.
/// Returns: new version number.
const LUA_PUT: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
local new_version
if current_version then
    new_version = tonumber(current_version) + 1
else
    new_version = 1
end

redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])
redis.call('ZADD', KEYS[2], 'NX', tonumber(ARGV[3]), ARGV[2])
redis.call('SADD', KEYS[3], ARGV[4])

return new_version
"#;

/// Insert only if absent.
///
/// Same KEYS/ARGV as [`LUA_PUT`].
/// Returns: 1 on insert, 0 if the key exists.
const LUA_INSERT_NEW: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end

redis.call('HSET', KEYS[1], 'version', '1', 'data', ARGV[1])
redis.call('ZADD', KEYS[2], 'NX', tonumber(ARGV[3]), ARGV[2])
redis.call('SADD', KEYS[3], ARGV[4])

return 1
"#;

/// Conditional put (CAS).
///
/// KEYS[1] = task hash. ARGV[1] = data, ARGV[2] = expected version.
/// Returns: {status, value} where status 1=success, 0=mismatch, -1=missing.
const LUA_PUT_IF_VERSION: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
if not current_version then
    return {-1, 0}
end

local expected = tonumber(ARGV[2])
local actual = tonumber(current_version)
if actual ~= expected then
    return {0, actual}
end

local new_version = actual + 1
redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])

return {1, new_version}
"#;

/// Delete: remove hash and index entry.
///
/// KEYS[1] = task hash, KEYS[2] = workflow index. ARGV[1] = task_id.
/// Returns: 1 if the key existed, 0 otherwise.
const LUA_DELETE: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
if existed == 1 then
    redis.call('DEL', KEYS[1])
    redis.call('ZREM', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

// ---------------------------------------------------------------------------
// RedisBackend struct
// ---------------------------------------------------------------------------

/// Redis storage backend.
///
/// Holds a [`MultiplexedConnection`]; clones share one TCP connection, and
/// each method clones it for concurrent use.
///
/// # Examples
///
/// ```rust,no_run
/// use armada_tasks::store::redis::RedisBackend;
///
/// # async fn example() {
/// let backend = RedisBackend::new("redis://127.0.0.1:6379")
///     .await
///     .unwrap()
///     .with_prefix("armada-staging");
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisBackend {
    /// Connects to Redis at `url` with the key prefix `"armada"`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the client can not be created
    /// or the connection fails.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let client = ::redis::Client::open(url).map_err(|e| StorageError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "armada".to_string(),
        }
    }

    /// Sets the key prefix used in every Redis key.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn task_key(&self, workflow: &str, task_id: &str) -> String {
        format!("{}:tasks:{}:{}", self.key_prefix, workflow, task_id)
    }

    fn index_key(&self, workflow: &str) -> String {
        format!("{}:idx:{}", self.key_prefix, workflow)
    }

    fn workflows_key(&self) -> String {
        format!("{}:workflows", self.key_prefix)
    }

    async fn list_workflow(
        &self,
        workflow: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let idx_key = self.index_key(workflow);
        let task_ids: Vec<String> = self
            .conn
            .clone()
            .zrange(&idx_key, 0, -1)
            .await
            .map_err(|e| map_redis_error(e, workflow))?;

        let mut results = Vec::with_capacity(task_ids.len());
        let mut orphaned_ids: Vec<String> = Vec::new();
        for task_id in &task_ids {
            let fields: HashMap<String, String> = self
                .conn
                .clone()
                .hgetall(self.task_key(workflow, task_id))
                .await
                .map_err(|e| map_redis_error(e, workflow))?;
            if fields.is_empty() {
                orphaned_ids.push(task_id.clone());
                continue;
            }
            let key = format!("{workflow}:{task_id}");
            results.push((key.clone(), parse_fields(&fields, &key)?));
        }

        if !orphaned_ids.is_empty() {
            // Best-effort index repair.
            let _: Result<(), ::redis::RedisError> =
                self.conn.clone().zrem(&idx_key, &orphaned_ids).await;
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// Splits `{workflow}:{task_id}`.
fn split_key(key: &str) -> Result<(&str, &str), StorageError> {
    key.split_once(':').ok_or_else(|| StorageError::Backend {
        message: format!("invalid key format (missing ':'): {key}"),
        source: None,
    })
}

/// Creation time in epoch milliseconds, the index score.
fn extract_created_at_ms(data: &[u8]) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    let created_at = value.get("createdAt")?.as_str()?;
    let dt = chrono::DateTime::parse_from_rfc3339(created_at).ok()?;
    Some(dt.timestamp_millis())
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> StorageError {
    StorageError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn as_utf8(data: &[u8]) -> Result<&str, StorageError> {
    std::str::from_utf8(data).map_err(|e| StorageError::Backend {
        message: format!("data is not valid UTF-8: {e}"),
        source: Some(Box::new(e)),
    })
}

fn parse_fields(
    fields: &HashMap<String, String>,
    key: &str,
) -> Result<VersionedRecord, StorageError> {
    let version: u64 = fields
        .get("version")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StorageError::Backend {
            message: format!("missing or invalid version field for key {key}"),
            source: None,
        })?;
    let data = fields.get("data").ok_or_else(|| StorageError::Backend {
        message: format!("missing data field for key {key}"),
        source: None,
    })?;
    Ok(VersionedRecord {
        data: data.as_bytes().to_vec(),
        version,
    })
}

// ---------------------------------------------------------------------------
// StorageBackend implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let (workflow, task_id) = split_key(key)?;
        let fields: HashMap<String, String> = self
            .conn
            .clone()
            .hgetall(self.task_key(workflow, task_id))
            .await
            .map_err(|e| map_redis_error(e, key))?;
        if fields.is_empty() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        parse_fields(&fields, key)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let (workflow, task_id) = split_key(key)?;
        let new_version: u64 = Script::new(LUA_PUT)
            .key(self.task_key(workflow, task_id))
            .key(self.index_key(workflow))
            .key(self.workflows_key())
            .arg(as_utf8(data)?)
            .arg(task_id)
            .arg(extract_created_at_ms(data).unwrap_or(0))
            .arg(workflow)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(new_version)
    }

    async fn insert_new(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let (workflow, task_id) = split_key(key)?;
        let inserted: i64 = Script::new(LUA_INSERT_NEW)
            .key(self.task_key(workflow, task_id))
            .key(self.index_key(workflow))
            .key(self.workflows_key())
            .arg(as_utf8(data)?)
            .arg(task_id)
            .arg(extract_created_at_ms(data).unwrap_or(0))
            .arg(workflow)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        if inserted == 1 {
            Ok(1)
        } else {
            Err(StorageError::AlreadyExists {
                key: key.to_string(),
            })
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let (workflow, task_id) = split_key(key)?;
        let (status, value): (i64, u64) = Script::new(LUA_PUT_IF_VERSION)
            .key(self.task_key(workflow, task_id))
            .arg(as_utf8(data)?)
            .arg(expected_version)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;

        match status {
            1 => Ok(value),
            0 => Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: value,
            }),
            _ => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let (workflow, task_id) = split_key(key)?;
        let result: i64 = Script::new(LUA_DELETE)
            .key(self.task_key(workflow, task_id))
            .key(self.index_key(workflow))
            .arg(task_id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(result == 1)
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        if let Some(workflow) = prefix.strip_suffix(':').filter(|w| !w.contains(':')) {
            return self.list_workflow(workflow).await;
        }

        let workflows: Vec<String> = self
            .conn
            .clone()
            .smembers(self.workflows_key())
            .await
            .map_err(|e| map_redis_error(e, prefix))?;
        let mut results = Vec::new();
        for workflow in workflows {
            results.extend(
                self.list_workflow(&workflow)
                    .await?
                    .into_iter()
                    .filter(|(key, _)| key.starts_with(prefix)),
            );
        }
        Ok(results)
    }
}
