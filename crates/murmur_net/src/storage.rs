//! Key storage backends.
//!
//! The swarm persists its private key under [`PRIVATE_KEY`] so a restarted
//! node keeps the same address.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{NetworkError, Result};

/// Storage key holding the node's private key.
pub const PRIVATE_KEY: &str = "privkey";

/// A small key/value byte store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Volatile storage, handy for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| NetworkError::Storage(format!("No entry for key {key:?}")))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// One file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(NetworkError::Storage(format!("Invalid storage key {key:?}")));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| NetworkError::Storage(format!("Failed to stat {}: {e}", path.display())))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| NetworkError::Storage(format!("Failed to read {}: {e}", path.display())))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            NetworkError::Storage(format!("Failed to create {}: {e}", self.dir.display()))
        })?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| NetworkError::Storage(format!("Failed to write {}: {e}", path.display())))?;
        debug!("Stored {key} in {}", self.dir.display());
        Ok(())
    }
}
