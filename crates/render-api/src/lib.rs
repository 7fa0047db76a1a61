//! Axum HTTP API for the render backend.
//!
//! This crate provides:
//! - Job submission with synchronous validation
//! - Status, active-job listing, queue statistics and performance metrics
//! - Cancel, pause and resume commands
//! - Per-client rate limiting and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
