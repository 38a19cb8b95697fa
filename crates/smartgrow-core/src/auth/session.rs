use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::credentials::{CredentialStore, StoreError};

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// On-disk shape of the session file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFile {
    #[serde(default)]
    pub slots: BTreeMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Credential store backed by a JSON file in the cache directory.
///
/// Every write rewrites the whole file through a temp file and rename, so a
/// crash leaves either the previous or the new contents on disk.
pub struct FileStore {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self::at(cache_dir.join(SESSION_FILE))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the session file; a missing file is an empty session.
    pub fn load(&self) -> Result<SessionFile, StoreError> {
        if !self.path.exists() {
            return Ok(SessionFile::default());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, mut file: SessionFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if file.slots.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
                debug!(path = ?self.path, "Session file removed");
            }
            return Ok(());
        }

        file.updated_at = Some(Utc::now());
        let contents = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut file = self.load()?;
        f(&mut file.slots);
        self.save(file)
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.io_lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.load()?.slots.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.modify(|slots| {
            slots.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.modify(|slots| {
            slots.remove(key);
        })
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let _guard = self.io_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let file = self.load()?;
        Ok(keys.iter().map(|key| file.slots.get(*key).cloned()).collect())
    }

    // One rename for all entries: another process reading the file sees
    // every slot updated or none.
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        self.modify(|slots| {
            for (key, value) in entries {
                slots.insert(key.to_string(), value.to_string());
            }
        })
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        self.modify(|slots| {
            for key in keys {
                slots.remove(*key);
            }
        })
    }
}
