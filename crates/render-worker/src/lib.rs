//! Render worker.
//!
//! This crate provides:
//! - Multi-stage rendering pipeline with pause/resume/cancel
//! - Content-addressed cache of finished renders
//! - Per-type worker pools with concurrency and rate limits
//! - Stage retries with exponential backoff
//! - Stall detection and graceful shutdown

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod retry;
pub mod stall;

pub use cache::{CacheConfig, CacheKey, CacheStats, RenderingCache};
pub use config::{PoolConfig, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use pipeline::{
    PipelineConfig, PipelineControl, PipelineOutcome, PipelineProgress, PipelineResult,
    PipelineState, RenderingPipeline,
};
pub use pool::{run_control_listener, ControlRegistry, WorkerPool};
pub use processor::{processor_for, JobContext, JobProcessor, QuietCalls};
pub use retry::{retry_async, retry_async_if, RetryPolicy, RetryResult};
pub use stall::StallDetector;
