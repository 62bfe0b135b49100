//! Small key/value cache backing the played-items record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use cast_core::{CastError, CastResult};

use crate::config::ClientConfig;

/// Byte-oriented key/value store.
pub trait Storage: Send + Sync {
    fn load(&self, key: &str) -> CastResult<Option<Vec<u8>>>;
    fn save(&self, key: &str, value: &[u8]) -> CastResult<()>;
}

/// Pick the backing store described by `config`.
pub fn open(config: &ClientConfig) -> Box<dyn Storage> {
    if config.cache_disabled {
        return Box::new(MemoryStorage::default());
    }
    match config.resolved_cache_path() {
        Some(path) => Box::new(FileStorage::new(path)),
        None => {
            tracing::warn!("no config directory available, played items will not persist");
            Box::new(MemoryStorage::default())
        }
    }
}

/// One JSON object on disk, mapping keys to UTF-8 values.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> CastResult<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| CastError::Storage(format!("corrupt cache {}: {e}", self.path.display())))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> CastResult<Option<Vec<u8>>> {
        let _guard = self.lock.lock().map_err(|_| CastError::Storage("cache lock poisoned".into()))?;
        Ok(self.read_map()?.remove(key).map(String::into_bytes))
    }

    fn save(&self, key: &str, value: &[u8]) -> CastResult<()> {
        let _guard = self.lock.lock().map_err(|_| CastError::Storage("cache lock poisoned".into()))?;
        let value = std::str::from_utf8(value)
            .map_err(|e| CastError::Storage(format!("value for {key} is not UTF-8: {e}")))?;

        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&map)?)?;
        Ok(())
    }
}

/// Process-local store, used when caching is disabled and in tests.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> CastResult<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| CastError::Storage("cache lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> CastResult<()> {
        let mut entries = self.entries.lock().map_err(|_| CastError::Storage("cache lock poisoned".into()))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        FileStorage::new(&path).save("application", b"{\"a\":1}").unwrap();
        FileStorage::new(&path).save("other", b"x").unwrap();

        let reopened = FileStorage::new(&path);
        assert_eq!(reopened.load("application").unwrap(), Some(b"{\"a\":1}".to_vec()));
        assert_eq!(reopened.load("other").unwrap(), Some(b"x".to_vec()));
        assert_eq!(reopened.load("missing").unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileStorage::new(&path).load("application").unwrap_err();
        assert!(matches!(err, CastError::Storage(_)));
    }

    #[test]
    fn disabled_cache_opens_memory_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            cache_disabled: true,
            cache_path: Some(dir.path().join("cache.json")),
            ..ClientConfig::default()
        };
        let store = open(&config);
        store.save("k", b"v").unwrap();
        assert_eq!(store.load("k").unwrap(), Some(b"v".to_vec()));
        assert!(!dir.path().join("cache.json").exists());
    }
}
