//! Filesystem object store for raw document bytes.
//!
//! Image ingestion stores the original bytes here and records the key on
//! the document and its sources. Keys are content hashes, so putting the
//! same bytes twice is a no-op.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::{KgError, KgResult};

#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Store bytes under a content-derived key. Returns the key.
    pub fn put(&self, bytes: &[u8]) -> KgResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let key = format!("o_{:.32}", hex::encode(hasher.finalize()));

        let path = self.path_for(&key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            std::fs::write(&path, bytes)?;
        }
        Ok(key)
    }

    /// Fetch bytes by key.
    pub fn get(&self, key: &str) -> KgResult<Vec<u8>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Err(KgError::NotFound(format!("object {}", key)));
        }
        Ok(std::fs::read(&path)?)
    }

    pub fn delete(&self, key: &str) -> KgResult<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    // Two-level fanout keeps directories small.
    fn path_for(&self, key: &str) -> PathBuf {
        let shard = key.get(2..4).unwrap_or("xx");
        self.root.join(shard).join(key)
    }
}
