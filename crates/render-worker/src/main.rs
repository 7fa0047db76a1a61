//! Render worker binary.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use render_media::{check_ffmpeg, check_ffprobe, FfmpegRunner, FfmpegStageRunner};
use render_models::JobType;
use render_queue::{ProgressMonitor, QueueConfig, RedisStore, RenderJobQueue};
use render_storage::{LocalStorage, LocalStorageConfig, ObjectStorage, R2Client};
use render_synth::{SynthBackend, SynthClient};
use render_worker::{
    metrics, processor_for, run_control_listener, CacheConfig, ControlRegistry, PipelineConfig,
    PoolConfig, RenderingCache, RenderingPipeline, RetryPolicy, StallDetector, WorkerConfig,
    WorkerPool,
};

fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("render=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
    Ok(())
}

fn storage_from_env() -> anyhow::Result<Arc<dyn ObjectStorage>> {
    if std::env::var("R2_BUCKET_NAME").is_ok() {
        info!("Using R2 object storage");
        Ok(Arc::new(R2Client::from_env().context("R2 storage")?))
    } else {
        info!("R2 not configured, using local storage");
        Ok(Arc::new(LocalStorage::new(LocalStorageConfig::from_env())))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing()?;

    info!("Starting render-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        metrics::init_metrics(port)?;
    }

    check_ffmpeg().context("ffmpeg is required")?;
    check_ffprobe().context("ffprobe is required")?;

    let queue_config = QueueConfig::from_env();
    let store = Arc::new(
        RedisStore::connect(&queue_config.redis_url, queue_config.key_prefix.clone())
            .await
            .context("connecting to Redis")?,
    );
    let monitor = Arc::new(ProgressMonitor::new(store.clone()));
    let queue = Arc::new(RenderJobQueue::new(store, monitor, queue_config));

    let storage = storage_from_env()?;
    let synth: Arc<dyn SynthBackend> = Arc::new(SynthClient::from_env().context("synthesis client")?);

    let cache = Arc::new(
        RenderingCache::open(CacheConfig::from_env())
            .await
            .context("opening render cache")?,
    );
    let ffmpeg = match config.stage_timeout {
        Some(timeout) => FfmpegRunner::new().with_timeout(timeout),
        None => FfmpegRunner::new(),
    };
    let pipeline = Arc::new(RenderingPipeline::new(
        Arc::new(FfmpegStageRunner::new(ffmpeg)),
        Some(cache),
        PipelineConfig {
            work_dir: config.work_dir.join("runs"),
            retry: RetryPolicy::from_env(),
        },
    ));
    let output_dir = config.work_dir.join("outputs");
    tokio::fs::create_dir_all(&output_dir)
        .await
        .context("creating output directory")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = ControlRegistry::new();
    let mut tasks = JoinSet::new();

    for job_type in [JobType::Video, JobType::Tts, JobType::Avatar] {
        let processor = processor_for(job_type, &pipeline, &synth, &storage, &output_dir);
        let pool = WorkerPool::new(
            PoolConfig::from_env(job_type),
            config.clone(),
            queue.clone(),
            processor,
            registry.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(e) = pool.run(shutdown).await {
                error!(job_type = job_type.as_str(), "Worker pool error: {}", e);
            }
        });
    }

    {
        let queue = queue.clone();
        let registry = registry.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(e) = run_control_listener(queue, registry, shutdown).await {
                error!("Control listener error: {}", e);
            }
        });
    }

    let detector = StallDetector::new(
        queue.clone(),
        config.stall_interval,
        config.stall_check_interval,
    );
    let shutdown = shutdown_rx.clone();
    tasks.spawn(async move { detector.run(shutdown).await });

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
    shutdown_tx.send(true).ok();

    // Pools drain on their own; this bounds the whole teardown.
    let grace = config.shutdown_timeout + std::time::Duration::from_secs(5);
    if tokio::time::timeout(grace, async { while tasks.join_next().await.is_some() {} })
        .await
        .is_err()
    {
        warn!("Shutdown did not finish in time, aborting");
        tasks.abort_all();
    }

    info!("Worker shutdown complete");
    Ok(())
}
