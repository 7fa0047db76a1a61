//! Local directory storage for development and single-host deployments.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::storage::{join_url, validate_key, ObjectStorage};

#[derive(Debug, Clone)]
pub struct LocalStorageConfig {
    pub root: PathBuf,
    /// Base URL the root is served under. `file://` URLs are returned when unset.
    pub public_url: Option<String>,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/artifacts"),
            public_url: None,
        }
    }
}

impl LocalStorageConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            root: std::env::var("LOCAL_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.root),
            public_url: std::env::var("LOCAL_STORAGE_PUBLIC_URL")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

/// Stores objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    config: LocalStorageConfig,
}

impl LocalStorage {
    pub fn new(config: LocalStorageConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.config.root.join(key))
    }

    fn url_for(&self, key: &str, path: &Path) -> String {
        match &self.config.public_url {
            Some(base) => join_url(base, key),
            None => format!("file://{}", path.display()),
        }
    }

    async fn prepare(&self, key: &str) -> StorageResult<PathBuf> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn upload(&self, data: Vec<u8>, key: &str, _content_type: &str) -> StorageResult<String> {
        let path = self.prepare(key).await?;
        debug!("Writing {} bytes to {}", data.len(), path.display());
        tokio::fs::write(&path, data).await?;
        Ok(self.url_for(key, &path))
    }

    async fn upload_file(&self, src: &Path, key: &str, _content_type: &str) -> StorageResult<String> {
        let path = self.prepare(key).await?;
        debug!("Copying {} to {}", src.display(), path.display());
        tokio::fs::copy(src, &path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::source_missing(src.display().to_string())
            } else {
                StorageError::upload(e)
            }
        })?;
        Ok(self.url_for(key, &path))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::removal(e)),
        }
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.config.root).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir, public_url: Option<&str>) -> LocalStorage {
        LocalStorage::new(LocalStorageConfig {
            root: dir.path().to_path_buf(),
            public_url: public_url.map(String::from),
        })
    }

    #[tokio::test]
    async fn test_upload_bytes_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = storage(&dir, Some("http://localhost:8080/artifacts"));

        let url = store
            .upload(b"audio".to_vec(), "renders/tts/j1.mp3", "audio/mpeg")
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:8080/artifacts/renders/tts/j1.mp3");
        let stored = dir.path().join("renders/tts/j1.mp3");
        assert_eq!(std::fs::read(&stored).unwrap(), b"audio");

        store.delete("renders/tts/j1.mp3").await.unwrap();
        assert!(!stored.exists());
        // Missing key is not an error.
        store.delete("renders/tts/j1.mp3").await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_file_returns_file_url() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("out.mp4");
        std::fs::write(&src, b"video").unwrap();

        let store = storage(&dir, None);
        let url = store
            .upload_file(&src, "renders/video/j2.mp4", "video/mp4")
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("renders/video/j2.mp4"));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = storage(&dir, None);
        let err = store.upload(vec![1], "../escape", "x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
