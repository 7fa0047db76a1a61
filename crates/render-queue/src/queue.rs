//! Priority job queue over a [`BackingStore`].

use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use render_models::{
    ControlAction, ControlCommand, Job, JobId, JobResult, JobStatus, JobSubmission, JobType,
    QueueStats, CONTROL_CHANNEL, DEFAULT_MAX_ATTEMPTS,
};

use crate::error::{QueueError, QueueResult};
use crate::progress::ProgressMonitor;
use crate::store::{ready_score, BackingStore};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: String,
    /// Prefix for every key the queue writes.
    pub key_prefix: String,
    pub max_attempts: u32,
    /// Delay before the first queue-level retry; doubles per attempt.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "render".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(2000),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            max_attempts: std::env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            backoff_base: std::env::var("QUEUE_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: defaults.backoff_max,
        }
    }

    /// Delay before re-running a job that has made `attempts` attempts.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.backoff_max)
    }
}

/// Outcome of [`RenderJobQueue::fail_or_retry`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Back in the delayed set.
    Retrying { attempt: u32, delay: Duration },
    /// Terminally failed.
    Failed,
    /// The caller no longer owns the job.
    NotOwner,
}

/// Outcome of [`RenderJobQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Queued job removed and marked cancelled.
    Cancelled,
    /// Cancel command sent to the owning worker.
    Signalled,
    /// Job had already finished.
    AlreadyFinished,
}

/// Durable priority queue with one ready set per job type.
pub struct RenderJobQueue {
    store: Arc<dyn BackingStore>,
    monitor: Arc<ProgressMonitor>,
    config: QueueConfig,
}

impl RenderJobQueue {
    pub fn new(store: Arc<dyn BackingStore>, monitor: Arc<ProgressMonitor>, config: QueueConfig) -> Self {
        Self {
            store,
            monitor,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ProgressMonitor> {
        &self.monitor
    }

    /// Validate, score and enqueue a submission.
    pub async fn submit(&self, submission: JobSubmission) -> QueueResult<JobId> {
        let (job_type, config) = submission.validate()?;
        let priority = submission.priority;
        let sequence = self.store.next_sequence().await?;

        let job = Job::new(
            job_type,
            priority,
            config,
            submission.metadata,
            sequence,
            self.config.max_attempts,
        );

        self.store
            .insert_ready(&job, ready_score(job.priority_score, job.sequence))
            .await?;

        info!(
            job_id = %job.id,
            job_type = job_type.as_str(),
            priority_score = job.priority_score,
            "Job queued"
        );
        self.monitor.emit(&job).await?;
        Ok(job.id)
    }

    pub async fn get_job(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        self.store.load_job(job_id).await
    }

    /// Pop the highest-priority queued job and take ownership of it.
    pub async fn dequeue(&self, job_type: JobType) -> QueueResult<Option<Job>> {
        loop {
            let Some(job_id) = self.store.pop_ready(job_type).await? else {
                return Ok(None);
            };

            let Some(mut job) = self.store.load_job(&job_id).await? else {
                warn!(job_id = %job_id, "Ready entry without a job record");
                continue;
            };
            if job.status != JobStatus::Queued {
                debug!(job_id = %job_id, status = job.status.as_str(), "Skipping stale ready entry");
                continue;
            }
            if self.store.cancel_requested(&job_id).await? {
                self.finish_cancelled(&mut job).await?;
                continue;
            }

            self.mark_active(&mut job).await?;
            return Ok(Some(job));
        }
    }

    async fn mark_active(&self, job: &mut Job) -> QueueResult<()> {
        let now = Utc::now();
        job.status = JobStatus::Active;
        job.started_at = Some(now);
        job.attempts += 1;
        job.worker_token = Some(Uuid::new_v4().to_string());

        self.store.save_job(job).await?;
        self.store
            .set_heartbeat(&job.id, now.timestamp_millis())
            .await?;
        self.monitor.emit(job).await?;

        debug!(job_id = %job.id, attempt = job.attempts, "Job active");
        Ok(())
    }

    /// Refresh the liveness heartbeat of an active job.
    pub async fn heartbeat(&self, job_id: &JobId) -> QueueResult<()> {
        self.store
            .set_heartbeat(job_id, Utc::now().timestamp_millis())
            .await
    }

    /// Whether a cancel was requested for the job and has not been settled.
    pub async fn cancel_requested(&self, job_id: &JobId) -> QueueResult<bool> {
        self.store.cancel_requested(job_id).await
    }

    /// Load a job and check that `token` still owns it.
    async fn owned(&self, job_id: &JobId, token: &str) -> QueueResult<Option<Job>> {
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| QueueError::not_found(job_id))?;

        if job.worker_token.as_deref() != Some(token) || job.status.is_terminal() {
            warn!(job_id = %job_id, "Ownership lost; ignoring update");
            return Ok(None);
        }
        Ok(Some(job))
    }

    /// Mark a job completed. Returns false when the caller no longer owns it.
    pub async fn complete(&self, job_id: &JobId, token: &str, result: JobResult) -> QueueResult<bool> {
        let Some(mut job) = self.owned(job_id, token).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.progress = 100;
        job.result = Some(result);
        job.error = None;
        job.failed_stage = None;
        job.worker_token = None;
        job.finished_at = Some(now);
        job.processing_time_ms = job
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);

        self.store.save_job(&job).await?;
        self.store.clear_heartbeat(job_id).await?;
        self.store.clear_cancel(job_id).await?;
        self.monitor.emit(&job).await?;

        info!(job_id = %job_id, processing_time_ms = ?job.processing_time_ms, "Job completed");
        Ok(true)
    }

    /// Requeue with backoff while attempts remain and the error is retryable;
    /// otherwise fail the job with `error` verbatim.
    pub async fn fail_or_retry(
        &self,
        job_id: &JobId,
        token: &str,
        error: &str,
        stage: Option<&str>,
        retryable: bool,
    ) -> QueueResult<FailOutcome> {
        let Some(mut job) = self.owned(job_id, token).await? else {
            return Ok(FailOutcome::NotOwner);
        };

        job.worker_token = None;
        self.store.clear_heartbeat(job_id).await?;

        if retryable && job.has_attempts_left() {
            let delay = self.config.retry_delay(job.attempts);
            job.status = JobStatus::Queued;
            self.store.save_job(&job).await?;

            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            self.store.push_delayed(job.job_type, job_id, ready_at).await?;
            self.monitor.emit(&job).await?;

            warn!(
                job_id = %job_id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error,
                "Job failed, retrying"
            );
            return Ok(FailOutcome::Retrying {
                attempt: job.attempts,
                delay,
            });
        }

        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.failed_stage = stage.map(String::from);
        job.finished_at = Some(now);
        job.processing_time_ms = job
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);

        self.store.save_job(&job).await?;
        self.store.clear_cancel(job_id).await?;
        self.monitor.emit(&job).await?;

        warn!(job_id = %job_id, attempts = job.attempts, stage, error, "Job failed");
        Ok(FailOutcome::Failed)
    }

    /// Record that the owning worker stopped the job on a cancel command.
    pub async fn mark_cancelled(&self, job_id: &JobId, token: &str) -> QueueResult<bool> {
        let Some(mut job) = self.owned(job_id, token).await? else {
            return Ok(false);
        };
        self.store.clear_heartbeat(job_id).await?;
        self.finish_cancelled(&mut job).await?;
        Ok(true)
    }

    async fn finish_cancelled(&self, job: &mut Job) -> QueueResult<()> {
        let now = Utc::now();
        job.status = JobStatus::Cancelled;
        job.worker_token = None;
        job.finished_at = Some(now);
        job.processing_time_ms = job
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);
        self.store.save_job(job).await?;
        self.store.clear_cancel(&job.id).await?;
        self.monitor.emit(job).await?;
        info!(job_id = %job.id, "Job cancelled");
        Ok(())
    }

    /// Move due delayed jobs back to the ready set. Returns how many moved.
    pub async fn promote_due(&self, job_type: JobType) -> QueueResult<usize> {
        let due = self
            .store
            .take_due(job_type, Utc::now().timestamp_millis())
            .await?;

        let mut promoted = 0;
        for job_id in due {
            match self.store.load_job(&job_id).await? {
                Some(job) if job.status == JobStatus::Queued => {
                    self.store
                        .push_ready(job_type, &job_id, ready_score(job.priority_score, job.sequence))
                        .await?;
                    promoted += 1;
                }
                _ => debug!(job_id = %job_id, "Dropping delayed entry for non-queued job"),
            }
        }

        if promoted > 0 {
            debug!(job_type = job_type.as_str(), promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    pub async fn cancel(&self, job_id: &JobId) -> QueueResult<CancelOutcome> {
        let mut job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| QueueError::not_found(job_id))?;

        match job.status {
            JobStatus::Queued => {
                let removed = self.store.remove_ready(job.job_type, job_id).await?
                    || self.store.remove_delayed(job.job_type, job_id).await?;
                if !removed {
                    // Popped by a worker in the meantime.
                    self.store.request_cancel(job_id).await?;
                    self.send_control(job_id, ControlAction::Cancel).await?;
                    return Ok(CancelOutcome::Signalled);
                }
                self.finish_cancelled(&mut job).await?;
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Active | JobStatus::Paused => {
                self.store.request_cancel(job_id).await?;
                self.send_control(job_id, ControlAction::Cancel).await?;
                Ok(CancelOutcome::Signalled)
            }
            _ => Ok(CancelOutcome::AlreadyFinished),
        }
    }

    /// Ask the owning worker to pause. Returns false unless the job is active.
    pub async fn pause(&self, job_id: &JobId) -> QueueResult<bool> {
        self.control_if(job_id, JobStatus::Active, ControlAction::Pause)
            .await
    }

    /// Ask the owning worker to resume. Returns false unless the job is paused.
    pub async fn resume(&self, job_id: &JobId) -> QueueResult<bool> {
        self.control_if(job_id, JobStatus::Paused, ControlAction::Resume)
            .await
    }

    async fn control_if(
        &self,
        job_id: &JobId,
        required: JobStatus,
        action: ControlAction,
    ) -> QueueResult<bool> {
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| QueueError::not_found(job_id))?;
        if job.status != required {
            return Ok(false);
        }
        self.send_control(job_id, action).await?;
        Ok(true)
    }

    async fn send_control(&self, job_id: &JobId, action: ControlAction) -> QueueResult<()> {
        let command = ControlCommand {
            job_id: job_id.clone(),
            action,
        };
        self.store
            .publish(CONTROL_CHANNEL, serde_json::to_string(&command)?)
            .await?;
        debug!(job_id = %job_id, ?action, "Control command sent");
        Ok(())
    }

    /// Stream of control commands for workers.
    pub async fn control_commands(&self) -> QueueResult<BoxStream<'static, ControlCommand>> {
        let raw = self.store.subscribe(CONTROL_CHANNEL).await?;
        Ok(Box::pin(raw.filter_map(|payload| async move {
            serde_json::from_str::<ControlCommand>(&payload).ok()
        })))
    }

    /// Active jobs whose heartbeat is older than `stall_after`.
    pub async fn stalled_jobs(&self, stall_after: Duration) -> QueueResult<Vec<Job>> {
        let cutoff = Utc::now().timestamp_millis() - stall_after.as_millis() as i64;
        let mut stalled = Vec::new();

        for (job_id, at) in self.store.heartbeats().await? {
            if at > cutoff {
                continue;
            }
            match self.store.load_job(&job_id).await? {
                Some(job) if matches!(job.status, JobStatus::Active | JobStatus::Paused) => {
                    stalled.push(job)
                }
                _ => self.store.clear_heartbeat(&job_id).await?,
            }
        }
        Ok(stalled)
    }

    /// Number of jobs ready to run now.
    pub async fn ready_len(&self, job_type: JobType) -> QueueResult<u64> {
        self.store.ready_len(job_type).await
    }

    pub async fn stats(&self, job_type: JobType) -> QueueResult<QueueStats> {
        let waiting = self.store.ready_len(job_type).await? + self.store.delayed_len(job_type).await?;
        let mut stats = QueueStats {
            waiting,
            ..Default::default()
        };

        for job in self.store.list_jobs().await? {
            if job.job_type != job_type {
                continue;
            }
            match job.status {
                JobStatus::Active | JobStatus::Paused => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.store.ping().await
    }
}
