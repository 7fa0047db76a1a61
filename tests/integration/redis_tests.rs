//! Redis-backed queue integration tests.
//!
//! Run with `REDIS_URL` pointing at a disposable server and `--ignored`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use render_models::{ControlAction, JobStatus, JobSubmission, JobType, Priority};
use render_queue::{
    BackingStore, CancelOutcome, FailOutcome, ProgressMonitor, QueueConfig, RedisStore,
    RenderJobQueue,
};
use uuid::Uuid;

/// Queue over a fresh key prefix so runs never see each other's data.
async fn queue() -> Arc<RenderJobQueue> {
    dotenvy::dotenv().ok();
    let config = QueueConfig {
        key_prefix: format!("render-test-{}", Uuid::new_v4()),
        backoff_base: Duration::ZERO,
        ..QueueConfig::from_env()
    };
    let store: Arc<dyn BackingStore> = Arc::new(
        RedisStore::connect(&config.redis_url, config.key_prefix.clone())
            .await
            .expect("Redis must be reachable"),
    );
    let monitor = Arc::new(ProgressMonitor::new(store.clone()));
    Arc::new(RenderJobQueue::new(store, monitor, config))
}

fn tts(priority: Priority) -> JobSubmission {
    JobSubmission::new(JobType::Tts, priority, serde_json::json!({"text": "integration"}))
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_ping() {
    queue().await.ping().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_priority_then_fifo_order() {
    let queue = queue().await;
    let normal_a = queue.submit(tts(Priority::Normal)).await.unwrap();
    let urgent = queue.submit(tts(Priority::Urgent)).await.unwrap();
    let normal_b = queue.submit(tts(Priority::Normal)).await.unwrap();
    let low = queue.submit(tts(Priority::Low)).await.unwrap();

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue(JobType::Tts).await.unwrap() {
        assert_eq!(job.status, JobStatus::Active);
        assert!(job.worker_token.is_some());
        order.push(job.id);
    }
    assert_eq!(order, vec![urgent, normal_a, normal_b, low]);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_retry_through_delayed_set_then_complete() {
    let queue = queue().await;
    let id = queue.submit(tts(Priority::High)).await.unwrap();

    let job = queue.dequeue(JobType::Tts).await.unwrap().unwrap();
    let token = job.worker_token.unwrap();
    let outcome = queue
        .fail_or_retry(&id, &token, "synthesis timed out", Some("synthesis"), true)
        .await
        .unwrap();
    assert!(matches!(outcome, FailOutcome::Retrying { attempt: 1, .. }));

    // The stale token can no longer write.
    assert!(!queue
        .complete(&id, &token, render_models::JobResult {
            artifact_url: "file:///stale".to_string(),
            duration_secs: None,
            size_bytes: 0,
            cached: false,
        })
        .await
        .unwrap());

    assert_eq!(queue.promote_due(JobType::Tts).await.unwrap(), 1);
    let job = queue.dequeue(JobType::Tts).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    let token = job.worker_token.unwrap();
    queue
        .monitor()
        .publish_as(&id, &token, None, 60)
        .await
        .unwrap()
        .unwrap();

    assert!(queue
        .complete(&id, &token, render_models::JobResult {
            artifact_url: "file:///renders/out.mp3".to_string(),
            duration_secs: Some(1.5),
            size_bytes: 2048,
            cached: false,
        })
        .await
        .unwrap());

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(queue.stats(JobType::Tts).await.unwrap().completed, 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_cancel_active_job_publishes_control_command() {
    let queue = queue().await;
    let id = queue.submit(tts(Priority::Normal)).await.unwrap();
    let mut commands = queue.control_commands().await.unwrap();

    queue.dequeue(JobType::Tts).await.unwrap().unwrap();
    assert_eq!(queue.cancel(&id).await.unwrap(), CancelOutcome::Signalled);

    let command = tokio::time::timeout(Duration::from_secs(5), commands.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(command.job_id, id);
    assert_eq!(command.action, ControlAction::Cancel);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_progress_channel_receives_events() {
    let queue = queue().await;
    let mut events = queue.monitor().subscribe_channel(JobType::Tts).await.unwrap();

    let id = queue.submit(tts(Priority::Normal)).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.job_id, id);
    assert_eq!(event.status, JobStatus::Queued);
}
