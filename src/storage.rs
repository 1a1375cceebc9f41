//! Persistence of SDK state across pause/resume and process restarts.
//!
//! The SDK only needs a small key-value blob store. [`FileStorage`] keeps one file per key in a
//! directory owned by the application; [`MemoryStorage`] keeps everything in memory and is useful
//! for tests or when durability is not required.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{de::DeserializeOwned, Serialize};

use crate::Result;

/// A key-value blob store for persisted SDK state.
pub trait Storage: Send + Sync {
    /// Load the blob stored under `key`, if any.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Store `data` under `key`, replacing any previous value.
    fn save(&self, key: &str, data: &[u8]) -> Result<()>;
    /// Remove the value stored under `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Load and decode a JSON value from `storage`.
pub(crate) fn load_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
    let Some(data) = storage.load(key)? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Encode `value` as JSON and store it in `storage`.
pub(crate) fn save_json<T: Serialize>(storage: &dyn Storage, key: &str, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    storage.save(key, &data)
}

/// Stores each key as a file inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create a storage rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> FileStorage {
        FileStorage { dir: dir.into() }
    }

    /// Directory that holds the persisted files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        // Write to a temporary file first so a crash mid-write never leaves a truncated state file.
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, self.path(key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Keeps persisted state in memory only.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty in-memory storage.
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| crate::Error::Generic)?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| crate::Error::Generic)?;
        entries.insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| crate::Error::Generic)?;
        entries.remove(key);
        Ok(())
    }
}

impl<T: Storage + ?Sized> Storage for std::sync::Arc<T> {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).load(key)
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        (**self).save(key, data)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}
