//! Storage error types.

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage misconfigured: {0}")]
    Misconfigured(String),

    #[error("artifact source missing: {0}")]
    SourceMissing(String),

    #[error("artifact upload failed: {0}")]
    Upload(String),

    #[error("artifact removal failed: {0}")]
    Removal(String),

    #[error("could not sign artifact url: {0}")]
    Signing(String),

    #[error("artifact key rejected: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bucket unreachable: {0}")]
    Unreachable(String),
}

impl StorageError {
    pub fn misconfigured(msg: impl Into<String>) -> Self {
        Self::Misconfigured(msg.into())
    }

    pub fn source_missing(path: impl Into<String>) -> Self {
        Self::SourceMissing(path.into())
    }

    pub fn upload(msg: impl ToString) -> Self {
        Self::Upload(msg.to_string())
    }

    pub fn removal(msg: impl ToString) -> Self {
        Self::Removal(msg.to_string())
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upload(_) | Self::Unreachable(_) | Self::Io(_))
    }
}
