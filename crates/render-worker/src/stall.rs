//! Recovery of jobs whose worker stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use render_queue::{FailOutcome, QueueResult, RenderJobQueue};

use crate::metrics;

/// Error recorded on a job that stalled on its last attempt.
pub const STALLED_ERROR: &str = "stalled";

pub struct StallDetector {
    queue: Arc<RenderJobQueue>,
    stall_after: Duration,
    interval: Duration,
}

impl StallDetector {
    pub fn new(queue: Arc<RenderJobQueue>, stall_after: Duration, interval: Duration) -> Self {
        Self {
            queue,
            stall_after,
            interval,
        }
    }

    /// Requeue or fail every stalled job. Returns how many were handled.
    pub async fn sweep(&self) -> QueueResult<usize> {
        let mut handled = 0;
        for job in self.queue.stalled_jobs(self.stall_after).await? {
            let Some(token) = job.worker_token.as_deref() else {
                continue;
            };
            let outcome = self
                .queue
                .fail_or_retry(&job.id, token, STALLED_ERROR, None, true)
                .await?;
            if outcome == FailOutcome::NotOwner {
                continue;
            }

            metrics::record_stalled_job(job.job_type.as_str());
            warn!(job_id = %job.id, job_type = job.job_type.as_str(), ?outcome, "Recovered stalled job");
            handled += 1;
        }
        Ok(handled)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            stall_after_secs = self.stall_after.as_secs(),
            "Stall detector started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("Stall sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_models::{JobStatus, JobSubmission, JobType, Priority};
    use render_queue::{MemoryStore, ProgressMonitor, QueueConfig};

    fn queue() -> Arc<RenderJobQueue> {
        let store = Arc::new(MemoryStore::new());
        let monitor = Arc::new(ProgressMonitor::new(store.clone()));
        let config = QueueConfig {
            max_attempts: 2,
            backoff_base: Duration::ZERO,
            ..Default::default()
        };
        Arc::new(RenderJobQueue::new(store, monitor, config))
    }

    fn submission() -> JobSubmission {
        JobSubmission::new(JobType::Tts, Priority::Normal, serde_json::json!({"text": "hello"}))
    }

    #[tokio::test]
    async fn test_stalled_job_is_requeued_then_failed() {
        let queue = queue();
        let id = queue.submit(submission()).await.unwrap();
        let detector = StallDetector::new(queue.clone(), Duration::ZERO, Duration::from_secs(1));

        queue.dequeue(JobType::Tts).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(detector.sweep().await.unwrap(), 1);
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().status, JobStatus::Queued);

        queue.promote_due(JobType::Tts).await.unwrap();
        queue.dequeue(JobType::Tts).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(detector.sweep().await.unwrap(), 1);

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(STALLED_ERROR));
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_is_left_alone() {
        let queue = queue();
        queue.submit(submission()).await.unwrap();
        queue.dequeue(JobType::Tts).await.unwrap().unwrap();

        let detector = StallDetector::new(queue, Duration::from_secs(60), Duration::from_secs(1));
        assert_eq!(detector.sweep().await.unwrap(), 0);
    }
}
