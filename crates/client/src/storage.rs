//! Persistent key-value storage.
//!
//! Values are JSON documents. [`FileStore`] keeps one file per key in the
//! client data directory:
//! - Linux: `~/.config/murmur/`
//! - macOS: `~/Library/Application Support/murmur/`
//! - Windows: `%APPDATA%\murmur\`

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

pub trait KeyValueStore: Send + Sync {
    /// Returns `true` if the value was written.
    fn save_raw(&self, key: &str, value: &str) -> bool;
    fn load_raw(&self, key: &str) -> Option<String>;
    fn remove_raw(&self, key: &str);
}

/// Save a value to persistent storage.
///
/// Returns `true` if the operation succeeded.
pub fn save<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => store.save_raw(key, &json),
        Err(e) => {
            tracing::error!(key, "Failed to encode stored value: {}", e);
            false
        }
    }
}

/// Load a value from persistent storage.
///
/// Returns `None` if the key doesn't exist or deserialization fails.
pub fn load<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let json = store.load_raw(key)?;
    match serde_json::from_str(&json) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, "Ignoring unreadable stored value: {}", e);
            None
        }
    }
}

/// JSON files in a directory, one per key.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under the platform config directory.
    pub fn in_config_dir() -> Option<Self> {
        Some(Self::new(dirs::config_dir()?.join("murmur")))
    }

    fn file_path(&self, key: &str) -> Option<PathBuf> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).ok()?;
        }
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        Some(self.dir.join(format!("{}.json", safe_key)))
    }
}

impl KeyValueStore for FileStore {
    fn save_raw(&self, key: &str, value: &str) -> bool {
        let Some(path) = self.file_path(key) else {
            return false;
        };
        // Readers only ever see a complete file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).is_ok() && std::fs::rename(&tmp, &path).is_ok()
    }

    fn load_raw(&self, key: &str) -> Option<String> {
        let path = self.file_path(key)?;
        std::fs::read_to_string(path).ok()
    }

    fn remove_raw(&self, key: &str) {
        if let Some(path) = self.file_path(key) {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Process-local store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn save_raw(&self, key: &str, value: &str) -> bool {
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.insert(key.to_string(), value.to_string());
                true
            }
            Err(_) => false,
        }
    }

    fn load_raw(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn remove_raw(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips_and_sanitizes_keys() {
        let dir = std::env::temp_dir().join(format!("murmur-store-{}", uuid::Uuid::new_v4()));
        let store = FileStore::new(&dir);

        assert!(save(&store, "queue:alice", &vec![1, 2, 3]));
        assert!(dir.join("queue_alice.json").exists());
        assert_eq!(load::<Vec<i32>>(&store, "queue:alice"), Some(vec![1, 2, 3]));

        store.remove_raw("queue:alice");
        assert_eq!(load::<Vec<i32>>(&store, "queue:alice"), None);
        let _ = std::fs::remove_dir_all(dir);
    }
}
