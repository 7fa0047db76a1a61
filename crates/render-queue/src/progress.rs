//! Progress publishing and job status reads.

use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use render_models::{
    Job, JobId, JobSnapshot, JobStatus, JobType, PerformanceMetrics, ProgressEvent,
};

use crate::error::{QueueError, QueueResult};
use crate::store::BackingStore;

/// Persists job progress and fans it out to pub/sub and local subscribers.
pub struct ProgressMonitor {
    store: Arc<dyn BackingStore>,
    subscribers: Mutex<HashMap<JobId, mpsc::UnboundedSender<ProgressEvent>>>,
}

impl ProgressMonitor {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self {
            store,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a status/progress update and broadcast it.
    ///
    /// Progress never decreases before a terminal status, and `completed`
    /// forces 100. Updates to a job that is already terminal are ignored and
    /// the persisted state is returned.
    pub async fn publish(
        &self,
        job_id: &JobId,
        status: JobStatus,
        progress: u8,
        error: Option<String>,
    ) -> QueueResult<ProgressEvent> {
        let mut job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| QueueError::not_found(job_id))?;

        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = job.status.as_str(), "Ignoring update for finished job");
            return Ok(ProgressEvent::from(&job));
        }

        apply_update(&mut job, Some(status), progress, error);
        self.store.save_job(&job).await?;
        self.emit(&job).await
    }

    /// Like [`publish`](Self::publish), but only while `token` owns the job.
    /// A `None` status records progress and keeps the stored status. Returns
    /// `None` for a worker that lost ownership.
    pub async fn publish_as(
        &self,
        job_id: &JobId,
        token: &str,
        status: Option<JobStatus>,
        progress: u8,
    ) -> QueueResult<Option<ProgressEvent>> {
        let mut job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| QueueError::not_found(job_id))?;

        if job.worker_token.as_deref() != Some(token) || job.status.is_terminal() {
            debug!(job_id = %job_id, "Dropping progress from a worker without ownership");
            return Ok(None);
        }

        apply_update(&mut job, status, progress, None);
        self.store.save_job(&job).await?;
        self.emit(&job).await.map(Some)
    }

    /// Broadcast the current state of a job without persisting it.
    pub async fn emit(&self, job: &Job) -> QueueResult<ProgressEvent> {
        let event = ProgressEvent::from(job);
        let payload = serde_json::to_string(&event)?;
        self.store
            .publish(job.job_type.progress_channel(), payload)
            .await?;

        let mut subscribers = self.subscribers.lock().await;
        if let Some(tx) = subscribers.get(&job.id) {
            if tx.send(event.clone()).is_err() || job.status.is_terminal() {
                subscribers.remove(&job.id);
            }
        }
        Ok(event)
    }

    /// Subscribe to one job's events. Replaces any previous subscriber.
    pub async fn subscribe(&self, job_id: &JobId) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.insert(job_id.clone(), tx);
        rx
    }

    /// Stream every event published for a job type.
    pub async fn subscribe_channel(
        &self,
        job_type: JobType,
    ) -> QueueResult<BoxStream<'static, ProgressEvent>> {
        let raw = self.store.subscribe(job_type.progress_channel()).await?;
        let events = raw.filter_map(|payload| async move {
            match serde_json::from_str::<ProgressEvent>(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Dropping malformed progress payload: {}", e);
                    None
                }
            }
        });
        Ok(Box::pin(events))
    }

    pub async fn get_job_progress(&self, job_id: &JobId) -> QueueResult<Option<JobSnapshot>> {
        Ok(self.store.load_job(job_id).await?.map(|job| job.snapshot()))
    }

    /// Snapshots of queued and active jobs, oldest first.
    pub async fn list_active_jobs(&self) -> QueueResult<Vec<JobSnapshot>> {
        let mut jobs: Vec<Job> = self
            .store
            .list_jobs()
            .await?
            .into_iter()
            .filter(|job| matches!(job.status, JobStatus::Queued | JobStatus::Active))
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs.iter().map(Job::snapshot).collect())
    }

    pub async fn get_performance_metrics(&self) -> QueueResult<PerformanceMetrics> {
        let jobs = self.store.list_jobs().await?;
        Ok(PerformanceMetrics::from_jobs(&jobs))
    }
}

fn apply_update(job: &mut Job, status: Option<JobStatus>, progress: u8, error: Option<String>) {
    let now = Utc::now();
    let status = status.unwrap_or(job.status);

    job.progress = match status {
        JobStatus::Completed => 100,
        _ => progress.min(100).max(job.progress),
    };

    if status == JobStatus::Active && job.started_at.is_none() {
        job.started_at = Some(now);
    }

    if status.is_terminal() {
        job.finished_at = Some(now);
        job.processing_time_ms = job
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);
    }

    if error.is_some() {
        job.error = error;
    }
    job.status = status;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use render_models::{JobConfig, Priority, TtsConfig};

    fn tts_job() -> Job {
        let config: TtsConfig = serde_json::from_value(serde_json::json!({"text": "hello"})).unwrap();
        Job::new(JobType::Tts, Priority::Normal, JobConfig::Tts(config), None, 1, 3)
    }

    async fn monitor_with(job: &Job) -> (ProgressMonitor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.save_job(job).await.unwrap();
        (ProgressMonitor::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_progress_is_clamped_and_monotonic() {
        let job = tts_job();
        let (monitor, _) = monitor_with(&job).await;

        let event = monitor.publish(&job.id, JobStatus::Active, 40, None).await.unwrap();
        assert_eq!(event.progress, 40);
        assert!(event.started_at.is_some());

        let event = monitor.publish(&job.id, JobStatus::Active, 10, None).await.unwrap();
        assert_eq!(event.progress, 40);

        let event = monitor.publish(&job.id, JobStatus::Active, 250, None).await.unwrap();
        assert_eq!(event.progress, 100);
    }

    #[tokio::test]
    async fn test_completed_forces_full_progress_and_timestamps() {
        let job = tts_job();
        let (monitor, _) = monitor_with(&job).await;

        monitor.publish(&job.id, JobStatus::Active, 5, None).await.unwrap();
        let event = monitor.publish(&job.id, JobStatus::Completed, 60, None).await.unwrap();
        assert_eq!(event.progress, 100);
        assert!(event.finished_at.is_some());
        assert!(event.processing_time_ms.is_some());

        // Terminal jobs do not change anymore.
        let event = monitor
            .publish(&job.id, JobStatus::Failed, 0, Some("late".to_string()))
            .await
            .unwrap();
        assert_eq!(event.status, JobStatus::Completed);
        assert!(event.error.is_none());
    }

    #[tokio::test]
    async fn test_local_subscriber_is_replaced() {
        let job = tts_job();
        let (monitor, _) = monitor_with(&job).await;

        let mut first = monitor.subscribe(&job.id).await;
        let mut second = monitor.subscribe(&job.id).await;

        monitor.publish(&job.id, JobStatus::Active, 20, None).await.unwrap();
        assert_eq!(second.recv().await.map(|e| e.progress), Some(20));
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_subscription_receives_events() {
        let job = tts_job();
        let (monitor, _) = monitor_with(&job).await;

        let mut events = monitor.subscribe_channel(JobType::Tts).await.unwrap();
        monitor.publish(&job.id, JobStatus::Active, 30, None).await.unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.progress, 30);
    }

    #[tokio::test]
    async fn test_publish_as_requires_token() {
        let mut job = tts_job();
        job.status = JobStatus::Active;
        job.worker_token = Some("owner".to_string());
        let (monitor, store) = monitor_with(&job).await;

        assert!(monitor
            .publish_as(&job.id, "stale", None, 50)
            .await
            .unwrap()
            .is_none());
        let event = monitor
            .publish_as(&job.id, "owner", Some(JobStatus::Paused), 50)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, JobStatus::Paused);
        assert_eq!(store.load_job(&job.id).await.unwrap().unwrap().progress, 50);
    }

    #[tokio::test]
    async fn test_progress_update_keeps_paused_status() {
        let mut job = tts_job();
        job.status = JobStatus::Active;
        job.worker_token = Some("owner".to_string());
        let (monitor, store) = monitor_with(&job).await;

        monitor
            .publish_as(&job.id, "owner", Some(JobStatus::Paused), 0)
            .await
            .unwrap();
        let event = monitor
            .publish_as(&job.id, "owner", None, 70)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.status, JobStatus::Paused);
        assert_eq!(event.progress, 70);
        assert_eq!(store.load_job(&job.id).await.unwrap().unwrap().status, JobStatus::Paused);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let monitor = ProgressMonitor::new(store);
        let err = monitor
            .publish(&JobId::new(), JobStatus::Active, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_active_listing_and_metrics() {
        let store = Arc::new(MemoryStore::new());
        let monitor = ProgressMonitor::new(store.clone());

        let queued = tts_job();
        let mut paused = tts_job();
        paused.status = JobStatus::Paused;
        let mut done = tts_job();
        done.status = JobStatus::Completed;
        done.processing_time_ms = Some(1_000);
        let mut failed = tts_job();
        failed.status = JobStatus::Failed;
        for job in [&queued, &paused, &done, &failed] {
            store.save_job(job).await.unwrap();
        }

        let active = monitor.list_active_jobs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, queued.id);

        let metrics = monitor.get_performance_metrics().await.unwrap();
        assert_eq!(metrics.total_jobs, 4);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.average_processing_time_ms, 1_000.0);
    }
}
