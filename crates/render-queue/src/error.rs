//! Queue error types.

use thiserror::Error;

use render_models::ValidationError;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Redis error: {0}")]
    Redis(redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BackingStoreUnavailable(msg.into())
    }

    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::JobNotFound(id.to_string())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackingStoreUnavailable(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            Self::BackingStoreUnavailable(e.to_string())
        } else {
            Self::Redis(e)
        }
    }
}
