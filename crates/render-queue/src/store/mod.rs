//! Backing store abstraction.
//!
//! The queue keeps all durable state in a [`BackingStore`]: job records, a
//! per-type ready set ordered by score, a per-type delayed set ordered by
//! ready-at time, worker heartbeats, pending cancel requests, a submission
//! sequence and pub/sub.

mod memory;
mod redis_store;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use render_models::{Job, JobId, JobType};

use crate::error::QueueResult;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Monotonically increasing submission counter.
    async fn next_sequence(&self) -> QueueResult<u64>;

    async fn save_job(&self, job: &Job) -> QueueResult<()>;

    /// Persist a new job record and add it to the ready set in one step, so
    /// no queued record exists without a ready entry.
    async fn insert_ready(&self, job: &Job, score: i64) -> QueueResult<()>;

    async fn load_job(&self, id: &JobId) -> QueueResult<Option<Job>>;

    async fn list_jobs(&self) -> QueueResult<Vec<Job>>;

    async fn push_ready(&self, job_type: JobType, id: &JobId, score: i64) -> QueueResult<()>;

    /// Remove and return the highest-scored ready job.
    async fn pop_ready(&self, job_type: JobType) -> QueueResult<Option<JobId>>;

    /// Returns true when the job was in the ready set.
    async fn remove_ready(&self, job_type: JobType, id: &JobId) -> QueueResult<bool>;

    async fn ready_len(&self, job_type: JobType) -> QueueResult<u64>;

    async fn push_delayed(&self, job_type: JobType, id: &JobId, ready_at_ms: i64) -> QueueResult<()>;

    /// Remove and return delayed jobs whose ready-at time is at or before `now_ms`.
    async fn take_due(&self, job_type: JobType, now_ms: i64) -> QueueResult<Vec<JobId>>;

    async fn remove_delayed(&self, job_type: JobType, id: &JobId) -> QueueResult<bool>;

    async fn delayed_len(&self, job_type: JobType) -> QueueResult<u64>;

    async fn set_heartbeat(&self, id: &JobId, at_ms: i64) -> QueueResult<()>;

    async fn clear_heartbeat(&self, id: &JobId) -> QueueResult<()>;

    async fn heartbeats(&self) -> QueueResult<Vec<(JobId, i64)>>;

    /// Record a cancel request. It stays visible to workers that pick the
    /// job up after the control message was published.
    async fn request_cancel(&self, id: &JobId) -> QueueResult<()>;

    async fn cancel_requested(&self, id: &JobId) -> QueueResult<bool>;

    async fn clear_cancel(&self, id: &JobId) -> QueueResult<()>;

    async fn publish(&self, channel: &str, payload: String) -> QueueResult<()>;

    async fn subscribe(&self, channel: &str) -> QueueResult<BoxStream<'static, String>>;

    async fn ping(&self) -> QueueResult<()>;
}

/// Ready-set score: priority dominates, earlier submissions win ties.
pub fn ready_score(priority_score: u32, sequence: u64) -> i64 {
    ((priority_score as i64) << 40) - (sequence & ((1 << 40) - 1)) as i64
}
