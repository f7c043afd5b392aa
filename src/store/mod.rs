//! Local question store and its storage backends.
//!
//! [`LocalStore`] owns the persisted records. Where the bytes go is decided
//! by the caller through a [`StorageBackend`]:
//!
//! * [`FileBackend`]:   one JSON file per key in a directory (the CLI)
//! * [`MemoryBackend`]: process memory with an optional byte quota (tests)
//! * [`NullBackend`]:   discards writes; for non-interactive contexts
//!
//! A backend write reports "out of space" as [`BackendError::QuotaExceeded`],
//! a value rather than an error type to be matched by identity, so the store
//! can surface [`crate::error::StoreError::QuotaExceeded`] reliably.

pub mod local;
pub mod schema;

pub use local::{LocalStore, StoreMetrics};
pub use schema::{
    Container, ContainerMetadata, ProcessingStatus, QuestionRecord, StoredImage,
    DEFAULT_QUOTA_BYTES, SCHEMA_VERSION, STORAGE_KEY,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Outcome of a failed backend operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The write did not fit in the remaining capacity.
    QuotaExceeded,
    /// Anything else.
    Other(String),
}

/// Key-value persistence used by [`LocalStore`].
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a value, `None` if the key was never written.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Total capacity in bytes, if the backend knows it.
    async fn estimate_quota(&self) -> Option<u64>;
}

// ── NullBackend ──────────────────────────────────────────────────────────

/// Accepts every write and remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

#[async_trait]
impl StorageBackend for NullBackend {
    async fn get(&self, _key: &str) -> Result<Option<String>, BackendError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn estimate_quota(&self) -> Option<u64> {
        None
    }
}

// ── MemoryBackend ────────────────────────────────────────────────────────

/// In-process map with an optional capacity in bytes (sum of all values).
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
    capacity: Option<u64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: Some(bytes),
        }
    }

    /// Pre-seed a value, bypassing the capacity check.
    pub fn insert_raw(&self, key: &str, value: &str) {
        if let Ok(mut map) = self.entries.lock() {
            map.insert(key.to_string(), value.to_string());
        }
    }

    /// Raw stored value, for inspection.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().ok().and_then(|m| m.get(key).cloned())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let map = self
            .entries
            .lock()
            .map_err(|e| BackendError::Other(e.to_string()))?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|e| BackendError::Other(e.to_string()))?;
        if let Some(cap) = self.capacity {
            let others: u64 = map
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            if others + value.len() as u64 > cap {
                return Err(BackendError::QuotaExceeded);
            }
        }
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn estimate_quota(&self) -> Option<u64> {
        self.capacity
    }
}

// ── FileBackend ──────────────────────────────────────────────────────────

/// One `<key>.json` file per key under a directory.
///
/// Writes go to a temp file that is then renamed over the target, so a
/// crash never leaves a half-written container behind.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
    capacity: Option<u64>,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            capacity: None,
        }
    }

    /// Refuse writes that would grow the directory's stored values past `bytes`.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Bytes used by every stored value except `exclude`.
    async fn used_bytes_excluding(&self, exclude: &Path) -> Result<u64, BackendError> {
        let mut total = 0;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BackendError::Other(e.to_string())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackendError::Other(e.to_string()))?
        {
            let path = entry.path();
            if path == exclude || path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

fn io_to_backend(e: std::io::Error) -> BackendError {
    if e.kind() == std::io::ErrorKind::StorageFull {
        BackendError::QuotaExceeded
    } else {
        BackendError::Other(e.to_string())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_to_backend(e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let path = self.path_for(key);

        if let Some(cap) = self.capacity {
            let used = self.used_bytes_excluding(&path).await?;
            if used + value.len() as u64 > cap {
                return Err(BackendError::QuotaExceeded);
            }
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_to_backend)?;

        // Atomic write: write to temp, then rename
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, value)
            .await
            .map_err(io_to_backend)?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(io_to_backend)?;

        debug!("Wrote {} bytes to {}", value.len(), path.display());
        Ok(())
    }

    async fn estimate_quota(&self) -> Option<u64> {
        self.capacity
    }
}
