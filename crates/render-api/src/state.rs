//! Application state.

use std::sync::Arc;

use render_queue::{ProgressMonitor, QueueConfig, QueueResult, RedisStore, RenderJobQueue};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub queue: Arc<RenderJobQueue>,
}

impl AppState {
    pub fn new(config: ApiConfig, queue: Arc<RenderJobQueue>) -> Self {
        Self { config, queue }
    }

    /// Connect to Redis using `QueueConfig::from_env`.
    pub async fn from_env(config: ApiConfig) -> QueueResult<Self> {
        let queue_config = QueueConfig::from_env();
        let store = Arc::new(
            RedisStore::connect(&queue_config.redis_url, queue_config.key_prefix.clone()).await?,
        );
        let monitor = Arc::new(ProgressMonitor::new(store.clone()));
        let queue = Arc::new(RenderJobQueue::new(store, monitor, queue_config));
        Ok(Self::new(config, queue))
    }

    pub fn monitor(&self) -> &Arc<ProgressMonitor> {
        self.queue.monitor()
    }
}
