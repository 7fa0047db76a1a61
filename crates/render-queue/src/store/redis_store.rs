use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, warn};

use render_models::{Job, JobId, JobType};

use super::BackingStore;
use crate::error::QueueResult;

/// Cancel requests outlive any worker that could still pick the job up.
const CANCEL_REQUEST_TTL_SECS: u64 = 24 * 60 * 60;

/// Redis-backed store. Records are JSON strings; ready and delayed sets are
/// sorted sets; heartbeats live in one hash.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisStore {
    /// Connect and verify the server answers.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let store = Self {
            client,
            conn,
            prefix: prefix.into(),
        };
        store.ping().await?;
        debug!("Connected to Redis backing store");
        Ok(store)
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn ready_key(&self, job_type: JobType) -> String {
        format!("{}:ready:{}", self.prefix, job_type.as_str())
    }

    fn delayed_key(&self, job_type: JobType) -> String {
        format!("{}:delayed:{}", self.prefix, job_type.as_str())
    }

    fn heartbeat_key(&self) -> String {
        format!("{}:heartbeats", self.prefix)
    }

    fn cancel_key(&self, id: &JobId) -> String {
        format!("{}:cancel:{}", self.prefix, id)
    }

    fn sequence_key(&self) -> String {
        format!("{}:seq", self.prefix)
    }
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn next_sequence(&self) -> QueueResult<u64> {
        let seq: u64 = self.conn().incr(self.sequence_key(), 1).await?;
        Ok(seq)
    }

    async fn save_job(&self, job: &Job) -> QueueResult<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .set(self.job_key(&job.id), payload)
            .ignore()
            .sadd(self.jobs_key(), job.id.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn insert_ready(&self, job: &Job, score: i64) -> QueueResult<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .set(self.job_key(&job.id), payload)
            .ignore()
            .sadd(self.jobs_key(), job.id.as_str())
            .ignore()
            .zadd(self.ready_key(job.job_type), job.id.as_str(), score as f64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_job(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let payload: Option<String> = self.conn().get(self.job_key(id)).await?;
        payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(Into::into)
    }

    async fn list_jobs(&self) -> QueueResult<Vec<Job>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(self.jobs_key()).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| self.job_key(&JobId::from_string(id.as_str())))
            .collect();
        let payloads: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads.into_iter().flatten() {
            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job record: {}", e),
            }
        }
        Ok(jobs)
    }

    async fn push_ready(&self, job_type: JobType, id: &JobId, score: i64) -> QueueResult<()> {
        self.conn()
            .zadd::<_, _, _, ()>(self.ready_key(job_type), id.as_str(), score as f64)
            .await?;
        Ok(())
    }

    async fn pop_ready(&self, job_type: JobType) -> QueueResult<Option<JobId>> {
        let popped: Vec<(String, f64)> = self.conn().zpopmax(self.ready_key(job_type), 1).await?;
        Ok(popped.into_iter().next().map(|(id, _)| JobId::from_string(id)))
    }

    async fn remove_ready(&self, job_type: JobType, id: &JobId) -> QueueResult<bool> {
        let removed: i64 = self.conn().zrem(self.ready_key(job_type), id.as_str()).await?;
        Ok(removed > 0)
    }

    async fn ready_len(&self, job_type: JobType) -> QueueResult<u64> {
        let len: u64 = self.conn().zcard(self.ready_key(job_type)).await?;
        Ok(len)
    }

    async fn push_delayed(&self, job_type: JobType, id: &JobId, ready_at_ms: i64) -> QueueResult<()> {
        self.conn()
            .zadd::<_, _, _, ()>(self.delayed_key(job_type), id.as_str(), ready_at_ms as f64)
            .await?;
        Ok(())
    }

    async fn take_due(&self, job_type: JobType, now_ms: i64) -> QueueResult<Vec<JobId>> {
        let key = self.delayed_key(job_type);
        let mut conn = self.conn();
        let due: Vec<String> = conn.zrangebyscore(&key, "-inf", now_ms as f64).await?;

        // Only the caller whose ZREM succeeds owns the promotion.
        let mut taken = Vec::with_capacity(due.len());
        for id in due {
            let removed: i64 = conn.zrem(&key, &id).await?;
            if removed > 0 {
                taken.push(JobId::from_string(id));
            }
        }
        Ok(taken)
    }

    async fn remove_delayed(&self, job_type: JobType, id: &JobId) -> QueueResult<bool> {
        let removed: i64 = self.conn().zrem(self.delayed_key(job_type), id.as_str()).await?;
        Ok(removed > 0)
    }

    async fn delayed_len(&self, job_type: JobType) -> QueueResult<u64> {
        let len: u64 = self.conn().zcard(self.delayed_key(job_type)).await?;
        Ok(len)
    }

    async fn set_heartbeat(&self, id: &JobId, at_ms: i64) -> QueueResult<()> {
        self.conn()
            .hset::<_, _, _, ()>(self.heartbeat_key(), id.as_str(), at_ms)
            .await?;
        Ok(())
    }

    async fn clear_heartbeat(&self, id: &JobId) -> QueueResult<()> {
        self.conn()
            .hdel::<_, _, ()>(self.heartbeat_key(), id.as_str())
            .await?;
        Ok(())
    }

    async fn heartbeats(&self) -> QueueResult<Vec<(JobId, i64)>> {
        let all: HashMap<String, i64> = self.conn().hgetall(self.heartbeat_key()).await?;
        Ok(all
            .into_iter()
            .map(|(id, at)| (JobId::from_string(id), at))
            .collect())
    }

    async fn request_cancel(&self, id: &JobId) -> QueueResult<()> {
        self.conn()
            .set_ex::<_, _, ()>(self.cancel_key(id), 1, CANCEL_REQUEST_TTL_SECS)
            .await?;
        Ok(())
    }

    async fn cancel_requested(&self, id: &JobId) -> QueueResult<bool> {
        let exists: bool = self.conn().exists(self.cancel_key(id)).await?;
        Ok(exists)
    }

    async fn clear_cancel(&self, id: &JobId) -> QueueResult<()> {
        self.conn().del::<_, ()>(self.cancel_key(id)).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> QueueResult<()> {
        self.conn().publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });

        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
