//! JSON persistence under `.storage/`
//!
//! Every file carries its key and a version next to the data:
//!
//! ```json
//! {
//!   "version": 1,
//!   "key": "fints4.config_entries",
//!   "data": { ... }
//! }
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported version for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Versioned wrapper written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub key: String,
    pub data: T,
}

impl<T> StorageFile<T> {
    pub fn new(key: impl Into<String>, data: T, version: u32) -> Self {
        Self {
            version,
            key: key.into(),
            data,
        }
    }
}

/// Handle on the `.storage/` directory of a config directory
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    /// Load a file, returning `None` if it does not exist yet
    pub async fn load<T>(&self, key: &str, version: u32) -> StorageResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let path = self.file_path(key);
        if !fs::try_exists(&path).await? {
            debug!("Storage file not found: {}", key);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let file: StorageFile<T> = serde_json::from_str(&content)?;
        if file.version != version {
            return Err(StorageError::VersionMismatch {
                key: key.to_string(),
                expected: version,
                found: file.version,
            });
        }

        debug!("Loaded storage file: {} (v{})", key, file.version);
        Ok(Some(file.data))
    }

    /// Write a file atomically (temp file, then rename)
    pub async fn save<T>(&self, file: &StorageFile<T>) -> StorageResult<()>
    where
        T: Serialize,
    {
        fs::create_dir_all(&self.storage_dir).await?;

        let path = self.file_path(&file.key);
        let temp_path = self.file_path(&format!("{}.tmp", file.key));
        let content = serde_json::to_string_pretty(file)?;

        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!("Saved storage file: {} (v{})", file.key, file.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        let loaded: Option<Vec<String>> = storage.load("nothing", 1).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        storage
            .save(&StorageFile::new("test.key", vec!["a".to_string()], 1))
            .await
            .unwrap();

        assert!(storage.file_path("test.key").exists());
        assert!(!storage.file_path("test.key.tmp").exists());

        let loaded: Option<Vec<String>> = storage.load("test.key", 1).await.unwrap();
        assert_eq!(loaded, Some(vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        storage
            .save(&StorageFile::new("test.key", 5u32, 2))
            .await
            .unwrap();

        let result: StorageResult<Option<u32>> = storage.load("test.key", 1).await;
        assert!(matches!(
            result,
            Err(StorageError::VersionMismatch { found: 2, .. })
        ));
    }
}
