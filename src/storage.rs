//! Durable byte storage for uploaded originals.

use anyhow::{anyhow, Context};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Opaque-key blob storage.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// A fresh key for an upload into `event_id`, keeping the file extension.
pub fn new_key(event_id: i64, extension: &str) -> String {
    let id: u64 = rand::thread_rng().gen();
    format!("events/{}/{:016x}.{}", event_id, id, extension.to_lowercase())
}

/// Blobs as files under a root directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::validation(format!("invalid storage key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write then rename so readers never see a partial file
        let partial = path.with_extension("part");
        std::fs::write(&partial, bytes)
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        std::fs::rename(&partial, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("blob {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Blobs in memory; for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .map_err(|e| anyhow!("Blob store lock poisoned: {}", e))?
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .map_err(|e| anyhow!("Blob store lock poisoned: {}", e))?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("blob {}", key)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.blobs
            .lock()
            .map_err(|e| anyhow!("Blob store lock poisoned: {}", e))?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let key = new_key(7, "JPG");
        assert!(key.starts_with("events/7/") && key.ends_with(".jpg"));

        store.put(&key, b"bytes").unwrap();
        assert_eq!(store.get(&key).unwrap(), b"bytes");

        store.delete(&key).unwrap();
        assert!(matches!(store.get(&key), Err(Error::NotFound(_))));
        store.delete(&key).unwrap();
    }

    #[test]
    fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        assert!(store.put("../outside", b"x").is_err());
        assert!(store.put("/etc/passwd", b"x").is_err());
        assert!(store.get("").is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryBlobStore::new();
        store.put("a", b"1").unwrap();
        assert_eq!(store.len(), 1);
        store.delete("a").unwrap();
        assert!(store.is_empty());
        assert!(store.get("a").is_err());
    }
}
