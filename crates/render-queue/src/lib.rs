//! Durable priority job queue and progress monitor.
//!
//! This crate provides:
//! - [`RenderJobQueue`]: validation, priority scoring, ownership-checked
//!   transitions, queue-level retries with backoff, cancel/pause/resume
//! - [`ProgressMonitor`]: persisted progress with pub/sub fan-out
//! - [`BackingStore`] implementations for Redis and in-process use

pub mod error;
pub mod progress;
pub mod queue;
pub mod store;

pub use error::{QueueError, QueueResult};
pub use progress::ProgressMonitor;
pub use queue::{CancelOutcome, FailOutcome, QueueConfig, RenderJobQueue};
pub use store::{ready_score, BackingStore, MemoryStore, RedisStore};
