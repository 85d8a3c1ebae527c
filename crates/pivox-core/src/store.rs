//! Persistent key-value seam backing the tiered cache and analytics.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{PivoxError, Result};

/// Keys under which the engine persists state.
pub mod keys {
    pub const CACHE_PRIMARY: &str = "pivox.cache.primary";
    pub const CACHE_SECONDARY: &str = "pivox.cache.secondary";
    pub const CACHE_TERTIARY: &str = "pivox.cache.tertiary";
    pub const CACHE_STATS: &str = "pivox.cache.stats";
    pub const ANALYTICS: &str = "pivox.analytics";
}

/// String-keyed JSON-value store. Writes are atomic per mutation and
/// serialized by the implementation.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// One file per key under a directory. Writes go to a temporary file and
/// rename into place so a crash never leaves a torn value.
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| PivoxError::Store(format!("failed to create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are dotted identifiers; anything else is flattened defensively.
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PivoxError::Store(format!("failed to read {}: {}", path.display(), e))),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| PivoxError::Store(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| PivoxError::Store(format!("failed to commit {}: {}", path.display(), e)))?;
        debug!(key, bytes = value.len(), "persisted");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PivoxError::Store(format!("failed to delete {}: {}", path.display(), e))),
        }
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: parking_lot::RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.inner.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.put("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("pivox-store-{}", uuid::Uuid::new_v4()));
        let store = JsonFileStore::new(&dir).unwrap();
        store.put(keys::CACHE_STATS, "{\"a\":1}").await.unwrap();
        assert_eq!(
            store.get(keys::CACHE_STATS).await.unwrap(),
            Some("{\"a\":1}".to_string())
        );
        store.delete(keys::CACHE_STATS).await.unwrap();
        assert_eq!(store.get(keys::CACHE_STATS).await.unwrap(), None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
