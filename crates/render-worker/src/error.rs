//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// A pipeline stage failed after exhausting its local retries.
    #[error("{message}")]
    Pipeline {
        stage: String,
        message: String,
        permanent: bool,
    },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Media error: {0}")]
    Media(#[from] render_media::MediaError),

    #[error("Storage error: {0}")]
    Storage(#[from] render_storage::StorageError),

    #[error("Synthesis error: {0}")]
    Synth(#[from] render_synth::SynthError),

    #[error("Queue error: {0}")]
    Queue(#[from] render_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn pipeline(stage: impl Into<String>, message: impl Into<String>, permanent: bool) -> Self {
        Self::Pipeline {
            stage: stage.into(),
            message: message.into(),
            permanent,
        }
    }

    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether the queue should give the job another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Pipeline { permanent, .. } => !permanent,
            WorkerError::Cancelled | WorkerError::InvalidJob(_) | WorkerError::ConfigError(_) => false,
            WorkerError::Media(e) => !e.is_permanent() && !e.is_cancelled(),
            WorkerError::Storage(e) => e.is_retryable(),
            WorkerError::Synth(e) => e.is_retryable(),
            WorkerError::Queue(_) | WorkerError::Io(_) => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            WorkerError::Cancelled => true,
            WorkerError::Media(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// Stage to record on the job when it fails terminally.
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            WorkerError::Pipeline { stage, .. } => Some(stage),
            WorkerError::Storage(_) => Some("upload"),
            WorkerError::Synth(_) => Some("synthesis"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_media::MediaError;
    use std::path::PathBuf;

    #[test]
    fn test_pipeline_error_displays_message_verbatim() {
        let err = WorkerError::pipeline("watermark", "FFmpeg command failed: exit 1", false);
        assert_eq!(err.to_string(), "FFmpeg command failed: exit 1");
        assert_eq!(err.failed_stage(), Some("watermark"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_permanent_errors_are_not_retryable() {
        assert!(!WorkerError::pipeline("audio_processing", "missing", true).is_retryable());
        assert!(!WorkerError::Media(MediaError::FileNotFound(PathBuf::from("/x"))).is_retryable());
        assert!(!WorkerError::invalid_job("wrong config").is_retryable());
    }

    #[test]
    fn test_cancellation_is_detected() {
        assert!(WorkerError::Cancelled.is_cancelled());
        assert!(WorkerError::Media(MediaError::Cancelled).is_cancelled());
        assert!(!WorkerError::Media(MediaError::Cancelled).is_retryable());
    }
}
