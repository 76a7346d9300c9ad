//! File-per-record storage backend.
//!
//! [`FileBackend`] stores each task as one file under a directory, so
//! tasks survive a process restart. Every write goes to a `.tmp` sibling
//! first and is then renamed over the record file, which keeps a record
//! readable if the process dies mid-write.
//!
//! # File Format
//!
//! ```text
//! v3
//! {"address":"counter:1", ...}
//! ```
//!
//! The first line holds the version, the rest is the stored bytes.
//!
//! Compare-and-swap is serialized by an in-process lock. Two processes
//! sharing one directory are not supported.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

const RECORD_EXTENSION: &str = "task";

/// Durable backend writing one file per key.
///
/// # Examples
///
/// ```no_run
/// use armada_tasks::store::file::FileBackend;
/// use armada_tasks::store::TaskStore;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let backend = FileBackend::open("/var/lib/armada/tasks").await.unwrap();
/// let store = TaskStore::new(backend);
/// # });
/// ```
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Opens (and creates if needed) the record directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the directory can not be
    /// created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::backend(format!("create {}", root.display()), e))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{RECORD_EXTENSION}", encode_key(key)))
    }

    async fn read(&self, key: &str) -> Result<Option<VersionedRecord>, StorageError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => parse_record(key, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::backend(format!("read {}", path.display()), e)),
        }
    }

    async fn write(&self, key: &str, data: &[u8], version: u64) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let mut contents = format!("v{version}\n").into_bytes();
        contents.extend_from_slice(data);
        tokio::fs::write(&tmp, &contents)
            .await
            .map_err(|e| StorageError::backend(format!("write {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::backend(format!("rename {}", path.display()), e))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        self.read(key).await?.ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;
        let version = self.read(key).await?.map_or(0, |r| r.version) + 1;
        self.write(key, data, version).await?;
        Ok(version)
    }

    async fn insert_new(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;
        if self.read(key).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                key: key.to_string(),
            });
        }
        self.write(key, data, 1).await?;
        Ok(1)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;
        let current = self.read(key).await?.ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }
        let version = expected_version + 1;
        self.write(key, data, version).await?;
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::backend(format!("remove {}", path.display()), e)),
        }
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::backend(format!("list {}", self.root.display()), e))?;

        let mut results = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::backend(format!("list {}", self.root.display()), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
            else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            // Deleted between read_dir and read.
            if let Some(record) = self.read(&key).await? {
                results.push((key, record));
            }
        }
        Ok(results)
    }
}

fn parse_record(key: &str, bytes: &[u8]) -> Result<VersionedRecord, StorageError> {
    let corrupt = || StorageError::Backend {
        message: format!("corrupt record file for {key}"),
        source: None,
    };
    let newline = bytes.iter().position(|b| *b == b'\n').ok_or_else(corrupt)?;
    let version = std::str::from_utf8(&bytes[..newline])
        .ok()
        .and_then(|line| line.strip_prefix('v'))
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(corrupt)?;
    Ok(VersionedRecord {
        data: bytes[newline + 1..].to_vec(),
        version,
    })
}

/// Maps a key to a portable file stem: ASCII alphanumerics, `-` and `_`
/// pass through, every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_round_trips() {
        let key = "composite-removal:4f1c/a b";
        let encoded = encode_key(key);
        assert!(!encoded.contains(':'));
        assert!(!encoded.contains('/'));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
    }

    #[test]
    fn corrupt_file_is_backend_error() {
        assert!(parse_record("k", b"no header").is_err());
        assert!(parse_record("k", b"vX\n{}").is_err());
        let ok = parse_record("k", b"v7\n{}").unwrap();
        assert_eq!(ok.version, 7);
        assert_eq!(ok.data, b"{}");
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).await.unwrap();
            backend.insert_new("counter:1", b"{\"a\":1}").await.unwrap();
            backend.put_if_version("counter:1", b"{\"a\":2}", 1).await.unwrap();
        }
        let backend = FileBackend::open(dir.path()).await.unwrap();
        let record = backend.get("counter:1").await.unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.data, b"{\"a\":2}");
    }

    #[tokio::test]
    async fn cas_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        backend.put("counter:1", b"x").await.unwrap();
        backend.put("other:1", b"y").await.unwrap();

        let err = backend.put_if_version("counter:1", b"z", 5).await.unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { actual: 1, .. }));
        let err = backend.insert_new("counter:1", b"z").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        let listed = backend.list_by_prefix("counter:").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "counter:1");

        assert!(backend.delete("counter:1").await.unwrap());
        assert!(!backend.delete("counter:1").await.unwrap());
        assert!(matches!(
            backend.get("counter:1").await.unwrap_err(),
            StorageError::NotFound { .. }
        ));
    }
}
