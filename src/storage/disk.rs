//! Media files stored on the local filesystem.

use crate::storage::{sanitize_file_name, MediaStore};
use crate::utils::{Result, StorageError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Media store writing one file per attachment under a root directory
#[derive(Debug, Clone)]
pub struct DiskMediaStore {
    root: PathBuf,
}

impl DiskMediaStore {
    /// Create a store rooted at `root`. The directory is created on first save.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let file_name = sanitize_file_name(name).ok_or_else(|| StorageError::Media {
            name: name.to_string(),
            reason: "empty file name".to_string(),
        })?;
        Ok(self.root.join(file_name))
    }
}

#[async_trait]
impl MediaStore for DiskMediaStore {
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(name)?;
        let media_error = |e: std::io::Error| StorageError::Media {
            name: name.to_string(),
            reason: e.to_string(),
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(media_error)?;
        tokio::fs::write(&path, bytes).await.map_err(media_error)?;

        log::debug!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    async fn load(&self, file_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(file_ref)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    key: file_ref.to_string(),
                }
                .into()
            } else {
                StorageError::Media {
                    name: file_ref.to_string(),
                    reason: e.to_string(),
                }
                .into()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = DiskMediaStore::new(dir.path().join("media"));

        let file_ref = store.save("voice.ogg", &[1, 2, 3]).await.unwrap();
        assert_eq!(file_ref, "voice.ogg");
        assert_eq!(store.load(&file_ref).await.unwrap(), vec![1, 2, 3]);
        assert!(dir.path().join("media").join("voice.ogg").exists());
    }

    #[tokio::test]
    async fn test_names_stay_inside_root() {
        let dir = TempDir::new().unwrap();
        let store = DiskMediaStore::new(dir.path().join("media"));

        let file_ref = store.save("../../escape.txt", b"x").await.unwrap();
        assert_eq!(file_ref, "escape.txt");
        assert!(store.root().join("escape.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
        assert!(store.save("../", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = DiskMediaStore::new(dir.path());
        assert!(store.load("nothing.bin").await.is_err());
    }
}
