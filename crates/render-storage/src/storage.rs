//! Storage abstraction shared by the R2 and local backends.

use async_trait::async_trait;
use std::path::Path;

use crate::error::{StorageError, StorageResult};

/// Destination for finished artifacts.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload bytes and return the artifact URL.
    async fn upload(&self, data: Vec<u8>, key: &str, content_type: &str) -> StorageResult<String>;

    /// Upload a local file and return the artifact URL.
    async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<String>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Check that the backend is reachable.
    async fn check_connectivity(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Object key for a job artifact: `renders/{job_type}/{job_id}.{ext}`.
pub fn artifact_key(job_type: &str, job_id: &str, extension: &str) -> String {
    format!("renders/{}/{}.{}", job_type, job_id, extension)
}

/// Reject keys that could escape a storage root.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Join a public base URL and key with exactly one slash.
pub(crate) fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key() {
        assert_eq!(artifact_key("video", "abc", "mp4"), "renders/video/abc.mp4");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("renders/tts/a.mp3").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://cdn.example.com/", "a/b.mp4"), "https://cdn.example.com/a/b.mp4");
    }
}
