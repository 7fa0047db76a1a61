//! Synthesis client error types.

use thiserror::Error;

pub type SynthResult<T> = Result<T, SynthError>;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("Synthesis service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SynthError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SynthError::ServiceUnavailable(_) | SynthError::Timeout(_) => true,
            SynthError::Network(e) => !e.is_builder(),
            _ => false,
        }
    }
}
