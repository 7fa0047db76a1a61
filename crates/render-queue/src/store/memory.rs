use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::{broadcast, Mutex};

use render_models::{Job, JobId, JobType};

use super::BackingStore;
use crate::error::QueueResult;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    sequence: u64,
    jobs: HashMap<JobId, Job>,
    ready: HashMap<JobType, BTreeSet<(i64, String)>>,
    delayed: HashMap<JobType, BTreeSet<(i64, String)>>,
    heartbeats: HashMap<JobId, i64>,
    cancel_requests: HashSet<JobId>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// Non-durable in-process store for tests and single-process development.
/// Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn remove_member(set: Option<&mut BTreeSet<(i64, String)>>, id: &JobId) -> bool {
    let Some(set) = set else {
        return false;
    };
    let found = set.iter().find(|(_, member)| member == id.as_str()).cloned();
    match found {
        Some(entry) => set.remove(&entry),
        None => false,
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn next_sequence(&self) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        state.sequence += 1;
        Ok(state.sequence)
    }

    async fn save_job(&self, job: &Job) -> QueueResult<()> {
        self.state.lock().await.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn insert_ready(&self, job: &Job, score: i64) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id.clone(), job.clone());
        let set = state.ready.entry(job.job_type).or_default();
        remove_member(Some(set), &job.id);
        set.insert((score, job.id.to_string()));
        Ok(())
    }

    async fn load_job(&self, id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(id).cloned())
    }

    async fn list_jobs(&self) -> QueueResult<Vec<Job>> {
        Ok(self.state.lock().await.jobs.values().cloned().collect())
    }

    async fn push_ready(&self, job_type: JobType, id: &JobId, score: i64) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let set = state.ready.entry(job_type).or_default();
        remove_member(Some(set), id);
        set.insert((score, id.to_string()));
        Ok(())
    }

    async fn pop_ready(&self, job_type: JobType) -> QueueResult<Option<JobId>> {
        let mut state = self.state.lock().await;
        Ok(state
            .ready
            .get_mut(&job_type)
            .and_then(|set| set.pop_last())
            .map(|(_, id)| JobId::from_string(id)))
    }

    async fn remove_ready(&self, job_type: JobType, id: &JobId) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        Ok(remove_member(state.ready.get_mut(&job_type), id))
    }

    async fn ready_len(&self, job_type: JobType) -> QueueResult<u64> {
        let state = self.state.lock().await;
        Ok(state.ready.get(&job_type).map_or(0, |s| s.len() as u64))
    }

    async fn push_delayed(&self, job_type: JobType, id: &JobId, ready_at_ms: i64) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let set = state.delayed.entry(job_type).or_default();
        remove_member(Some(set), id);
        set.insert((ready_at_ms, id.to_string()));
        Ok(())
    }

    async fn take_due(&self, job_type: JobType, now_ms: i64) -> QueueResult<Vec<JobId>> {
        let mut state = self.state.lock().await;
        let Some(set) = state.delayed.get_mut(&job_type) else {
            return Ok(Vec::new());
        };
        let due: Vec<(i64, String)> = set.iter().take_while(|(at, _)| *at <= now_ms).cloned().collect();
        for entry in &due {
            set.remove(entry);
        }
        Ok(due.into_iter().map(|(_, id)| JobId::from_string(id)).collect())
    }

    async fn remove_delayed(&self, job_type: JobType, id: &JobId) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        Ok(remove_member(state.delayed.get_mut(&job_type), id))
    }

    async fn delayed_len(&self, job_type: JobType) -> QueueResult<u64> {
        let state = self.state.lock().await;
        Ok(state.delayed.get(&job_type).map_or(0, |s| s.len() as u64))
    }

    async fn set_heartbeat(&self, id: &JobId, at_ms: i64) -> QueueResult<()> {
        self.state.lock().await.heartbeats.insert(id.clone(), at_ms);
        Ok(())
    }

    async fn clear_heartbeat(&self, id: &JobId) -> QueueResult<()> {
        self.state.lock().await.heartbeats.remove(id);
        Ok(())
    }

    async fn heartbeats(&self) -> QueueResult<Vec<(JobId, i64)>> {
        let state = self.state.lock().await;
        Ok(state.heartbeats.iter().map(|(id, at)| (id.clone(), *at)).collect())
    }

    async fn request_cancel(&self, id: &JobId) -> QueueResult<()> {
        self.state.lock().await.cancel_requests.insert(id.clone());
        Ok(())
    }

    async fn cancel_requested(&self, id: &JobId) -> QueueResult<bool> {
        Ok(self.state.lock().await.cancel_requests.contains(id))
    }

    async fn clear_cancel(&self, id: &JobId) -> QueueResult<()> {
        self.state.lock().await.cancel_requests.remove(id);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> QueueResult<()> {
        let state = self.state.lock().await;
        if let Some(tx) = state.channels.get(channel) {
            // No subscribers is not an error.
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<BoxStream<'static, String>> {
        let mut state = self.state.lock().await;
        let rx = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ready_score;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_pop_ready_highest_first() {
        let store = MemoryStore::new();
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        store.push_ready(JobType::Video, &a, ready_score(5, 1)).await.unwrap();
        store.push_ready(JobType::Video, &b, ready_score(20, 2)).await.unwrap();
        store.push_ready(JobType::Video, &c, ready_score(1, 3)).await.unwrap();

        assert_eq!(store.pop_ready(JobType::Video).await.unwrap(), Some(b));
        assert_eq!(store.pop_ready(JobType::Video).await.unwrap(), Some(a));
        assert_eq!(store.pop_ready(JobType::Video).await.unwrap(), Some(c));
        assert_eq!(store.pop_ready(JobType::Video).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_take_due_only_returns_due() {
        let store = MemoryStore::new();
        let (early, late) = (JobId::new(), JobId::new());
        store.push_delayed(JobType::Tts, &early, 1_000).await.unwrap();
        store.push_delayed(JobType::Tts, &late, 5_000).await.unwrap();

        assert_eq!(store.take_due(JobType::Tts, 2_000).await.unwrap(), vec![early]);
        assert_eq!(store.delayed_len(JobType::Tts).await.unwrap(), 1);
        assert!(store.remove_delayed(JobType::Tts, &late).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_requests_until_cleared() {
        let store = MemoryStore::new();
        let id = JobId::new();
        assert!(!store.cancel_requested(&id).await.unwrap());

        store.request_cancel(&id).await.unwrap();
        store.request_cancel(&id).await.unwrap();
        assert!(store.cancel_requested(&id).await.unwrap());

        store.clear_cancel(&id).await.unwrap();
        assert!(!store.cancel_requested(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pubsub_delivers_to_subscribers() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("render:progress").await.unwrap();
        store.publish("render:progress", "hello".to_string()).await.unwrap();
        assert_eq!(sub.next().await.as_deref(), Some("hello"));
    }
}
