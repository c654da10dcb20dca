//! Persistence collaborator (§6): an abstract key-value store with
//! atomic-write semantics. The CORE only ever calls `load`/`save`; the
//! concrete file layout, backup rotation, etc. belong to the excluded
//! operator surface.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug)]
pub enum PersistenceError {
    Io(String),
    Serialization(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Io(m) => write!(f, "persistence I/O error: {m}"),
            PersistenceError::Serialization(m) => write!(f, "persistence serialization error: {m}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Keys used by CORE components, per §6.
pub mod keys {
    pub const BBS: &str = "bbs";
    pub const BBS_SETTINGS: &str = "bbsSettings";
    pub const BBS_USERS: &str = "bbsUsers";
    pub const CHAT_HISTORY: &str = "chatHistory";
    pub const DIGIPEATER_SETTINGS: &str = "digipeaterSettings";
    pub const LAST_HEARD: &str = "lastHeard";
    pub const METRIC_ALERTS: &str = "metricAlerts";
    pub const WINLINK_SETTINGS: &str = "winlinkSettings";
    pub const ACTIVE_ALERTS: &str = "activeAlerts";
}

/// Abstract key-value persistence with atomic-write semantics: a
/// `PersistenceFailure` (§7) never corrupts on-disk state, and in-memory
/// state remains authoritative regardless of outcome.
pub trait Store: Send + Sync {
    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PersistenceError>;
    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError>;
}

/// Writes `<dir>/<key>.json` atomically: serialize to `<file>.tmp`, then
/// rename over the destination so a crash mid-write never leaves a
/// truncated file behind (§5's "write, fsync, rename" requirement).
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStore { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Store for FileStore {
    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PersistenceError::Io(e.to_string()))?;
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        let dest = self.path_for(key);
        let tmp = dest.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| PersistenceError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &dest).map_err(|e| PersistenceError::Io(e.to_string()))?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|e| PersistenceError::Io(e.to_string()))?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(Some(value))
    }
}

/// In-memory store for tests and for components run without a configured
/// data directory.
#[derive(Default)]
pub struct MemStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }
}

impl Store for MemStore {
    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(value).map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        self.data.lock().unwrap().insert(key.to_string(), json);
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        let guard = self.data.lock().unwrap();
        match guard.get(key) {
            Some(json) => {
                let value = serde_json::from_str(json)
                    .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[test]
    fn mem_store_round_trips() {
        let store = MemStore::new();
        let w = Widget { name: "a".into(), count: 3 };
        store.save("widget", &w).unwrap();
        let loaded: Option<Widget> = store.load("widget").unwrap();
        assert_eq!(loaded, Some(w));
    }

    #[test]
    fn mem_store_missing_key_is_none() {
        let store = MemStore::new();
        let loaded: Option<Widget> = store.load("missing").unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn file_store_round_trips_atomically() {
        let dir = std::env::temp_dir().join(format!("ax25node-test-{}", std::process::id()));
        let store = FileStore::new(&dir);
        let w = Widget { name: "b".into(), count: 7 };
        store.save(keys::BBS, &w).unwrap();
        let loaded: Option<Widget> = store.load(keys::BBS).unwrap();
        assert_eq!(loaded, Some(w));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
