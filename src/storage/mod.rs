//! Persistence backends for the vault.
//!
//! The vault only ever sees the [`SecretStore`] trait. Values are opaque
//! byte blobs; the vault owns the key namespaces.

use crate::core::errors::CustodyError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Key/value persistence used by the vault.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CustodyError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), CustodyError>;

    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), CustodyError>;

    /// All keys, sorted.
    fn keys(&self) -> Result<Vec<String>, CustodyError>;
}

/// Volatile in-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CustodyError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), CustodyError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CustodyError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, CustodyError> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

/// JSON file store: one object mapping keys to hex-encoded values.
///
/// Every mutation rewrites the file through a temp file and a rename, so a
/// crash leaves either the old or the new document on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or create on first write) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CustodyError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            BTreeMap::new()
        };
        info!("Opened secret store at {} ({} entries)", path.display(), entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), CustodyError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(entries)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("Persisted {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

impl SecretStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CustodyError> {
        match self.entries.lock().get(key) {
            Some(v) => hex::decode(v)
                .map(Some)
                .map_err(|e| CustodyError::Storage(format!("corrupt entry {}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), CustodyError> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        next.insert(key.to_string(), hex::encode(value));
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CustodyError> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, CustodyError> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}
