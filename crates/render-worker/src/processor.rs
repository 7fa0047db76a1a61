//! Per-type job processors.

use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use render_media::probe_media;
use render_models::{Job, JobConfig, JobResult, JobType};
use render_storage::{artifact_key, ObjectStorage, StorageError, StorageResult};
use render_synth::{AvatarRequest, SynthBackend, SynthResult, SynthesizedMedia, TtsRequest};

use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::pipeline::{PipelineControl, PipelineOutcome, RenderingPipeline};

/// Share of overall progress given to rendering; the rest covers upload.
const RENDER_SHARE: f64 = 0.95;

/// Longest an artifact upload may take.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Counts calls in flight that report no progress but end on their own
/// timeout. While any is running the worker keeps the job's heartbeat fresh.
#[derive(Debug, Clone, Default)]
pub struct QuietCalls(Arc<AtomicUsize>);

impl QuietCalls {
    pub fn in_flight(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }

    fn enter(&self) -> QuietGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        QuietGuard(self.0.clone())
    }
}

struct QuietGuard(Arc<AtomicUsize>);

impl Drop for QuietGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handles a processor needs while working on one job attempt.
pub struct JobContext {
    pub control: PipelineControl,
    pub logger: JobLogger,
    progress: mpsc::UnboundedSender<u8>,
    quiet: QuietCalls,
}

impl JobContext {
    pub fn new(control: PipelineControl, logger: JobLogger, progress: mpsc::UnboundedSender<u8>) -> Self {
        Self {
            control,
            logger,
            progress,
            quiet: QuietCalls::default(),
        }
    }

    /// Progress reports are the job's liveness signal.
    pub fn report(&self, percent: u8) {
        let _ = self.progress.send(percent.min(100));
    }

    pub fn quiet_calls(&self) -> QuietCalls {
        self.quiet.clone()
    }

    /// Run a call that reports no progress. `call` must be bounded by its own
    /// timeout; a stuck unbounded call would never be detected as stalled.
    pub async fn keep_alive<F: Future>(&self, call: F) -> F::Output {
        let _guard = self.quiet.enter();
        call.await
    }

    /// Wait out a pause, fail on cancel.
    pub async fn checkpoint(&self) -> WorkerResult<()> {
        self.control.checkpoint().await.map_err(|_| WorkerError::Cancelled)
    }
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job, ctx: &JobContext) -> WorkerResult<JobResult>;
}

/// Video composition: rendering pipeline, then upload.
pub struct VideoProcessor {
    pipeline: Arc<RenderingPipeline>,
    storage: Arc<dyn ObjectStorage>,
    output_dir: PathBuf,
}

impl VideoProcessor {
    pub fn new(pipeline: Arc<RenderingPipeline>, storage: Arc<dyn ObjectStorage>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline,
            storage,
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl JobProcessor for VideoProcessor {
    async fn process(&self, job: &Job, ctx: &JobContext) -> WorkerResult<JobResult> {
        let JobConfig::Video(config) = &job.config else {
            return Err(WorkerError::invalid_job("expected a video config"));
        };
        let format = config.settings.output.format;
        let output = self
            .output_dir
            .join(format!("{}.{}", job.id, format.extension()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let execute = self.pipeline.execute(
            Path::new(&config.source),
            &output,
            &config.settings,
            &ctx.control,
            Some(tx),
        );
        let forward = async {
            while let Some(update) = rx.recv().await {
                ctx.report((update.overall_percent * RENDER_SHARE).floor() as u8);
            }
        };
        let (result, ()) = tokio::join!(execute, forward);

        match result.outcome {
            PipelineOutcome::Completed | PipelineOutcome::Cached => {}
            PipelineOutcome::Cancelled => return Err(WorkerError::Cancelled),
            PipelineOutcome::Failed {
                stage,
                error,
                permanent,
            } => return Err(WorkerError::pipeline(stage, error, permanent)),
        }
        ctx.logger.progress(&format!(
            "rendered {} stage(s) in {:?}{}",
            result.stages.len(),
            result.total_duration,
            if result.cached() { " (cached)" } else { "" }
        ));

        let uploaded = upload_output(
            self.storage.as_ref(),
            job,
            &output,
            format.extension(),
            format.content_type(),
            ctx,
        )
        .await;
        if let Err(e) = tokio::fs::remove_file(&output).await {
            debug!("Failed to remove local output {}: {}", output.display(), e);
        }
        let (artifact_url, size_bytes, duration_secs) = uploaded?;

        Ok(JobResult {
            artifact_url,
            duration_secs,
            size_bytes,
            cached: result.cached(),
        })
    }
}

async fn upload_output(
    storage: &dyn ObjectStorage,
    job: &Job,
    output: &Path,
    extension: &str,
    content_type: &str,
    ctx: &JobContext,
) -> WorkerResult<(String, u64, Option<f64>)> {
    ctx.checkpoint().await?;
    let size_bytes = tokio::fs::metadata(output).await?.len();
    let duration_secs = probe_media(output).await.ok().map(|info| info.duration);

    let key = artifact_key(job.job_type.as_str(), job.id.as_str(), extension);
    let url = bounded_upload(ctx, storage.upload_file(output, &key, content_type)).await?;
    Ok((url, size_bytes, duration_secs))
}

async fn bounded_upload<F>(ctx: &JobContext, upload: F) -> WorkerResult<String>
where
    F: Future<Output = StorageResult<String>>,
{
    match ctx.keep_alive(tokio::time::timeout(UPLOAD_TIMEOUT, upload)).await {
        Ok(url) => Ok(url?),
        Err(_) => Err(StorageError::upload(format!(
            "timed out after {}s",
            UPLOAD_TIMEOUT.as_secs()
        ))
        .into()),
    }
}

/// Races a synthesis call against cancellation. The synthesis client
/// enforces its own request timeout.
async fn synthesize<F>(ctx: &JobContext, call: F) -> WorkerResult<SynthesizedMedia>
where
    F: Future<Output = SynthResult<SynthesizedMedia>> + Send,
{
    ctx.checkpoint().await?;
    tokio::select! {
        media = ctx.keep_alive(call) => Ok(media?),
        _ = ctx.control.cancelled() => Err(WorkerError::Cancelled),
    }
}

async fn publish_media(
    storage: &dyn ObjectStorage,
    job: &Job,
    media: SynthesizedMedia,
    extension: &str,
    ctx: &JobContext,
) -> WorkerResult<JobResult> {
    ctx.checkpoint().await?;
    let key = artifact_key(job.job_type.as_str(), job.id.as_str(), extension);
    let size_bytes = media.size_bytes();
    let duration_secs = media.duration_secs;
    let artifact_url = bounded_upload(ctx, storage.upload(media.bytes, &key, &media.content_type)).await?;

    Ok(JobResult {
        artifact_url,
        duration_secs,
        size_bytes,
        cached: false,
    })
}

/// Text-to-speech: one synthesis call, then upload.
pub struct TtsProcessor {
    synth: Arc<dyn SynthBackend>,
    storage: Arc<dyn ObjectStorage>,
}

impl TtsProcessor {
    pub fn new(synth: Arc<dyn SynthBackend>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self { synth, storage }
    }
}

#[async_trait]
impl JobProcessor for TtsProcessor {
    async fn process(&self, job: &Job, ctx: &JobContext) -> WorkerResult<JobResult> {
        let JobConfig::Tts(config) = &job.config else {
            return Err(WorkerError::invalid_job("expected a tts config"));
        };

        ctx.report(10);
        let request = TtsRequest::from(config);
        let media = synthesize(ctx, self.synth.synthesize_speech(&request)).await?;
        ctx.report(80);

        publish_media(self.storage.as_ref(), job, media, config.format.extension(), ctx).await
    }
}

/// Talking avatar: one render call, then upload.
pub struct AvatarProcessor {
    synth: Arc<dyn SynthBackend>,
    storage: Arc<dyn ObjectStorage>,
}

impl AvatarProcessor {
    pub fn new(synth: Arc<dyn SynthBackend>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self { synth, storage }
    }
}

#[async_trait]
impl JobProcessor for AvatarProcessor {
    async fn process(&self, job: &Job, ctx: &JobContext) -> WorkerResult<JobResult> {
        let JobConfig::Avatar(config) = &job.config else {
            return Err(WorkerError::invalid_job("expected an avatar config"));
        };

        ctx.report(5);
        let request = AvatarRequest::from(config);
        let media = synthesize(ctx, self.synth.render_avatar(&request)).await?;
        ctx.report(85);

        publish_media(
            self.storage.as_ref(),
            job,
            media,
            config.output.format.extension(),
            ctx,
        )
        .await
    }
}

/// Processor for a job type.
pub fn processor_for(
    job_type: JobType,
    pipeline: &Arc<RenderingPipeline>,
    synth: &Arc<dyn SynthBackend>,
    storage: &Arc<dyn ObjectStorage>,
    output_dir: &Path,
) -> Arc<dyn JobProcessor> {
    match job_type {
        JobType::Video => Arc::new(VideoProcessor::new(pipeline.clone(), storage.clone(), output_dir)),
        JobType::Tts => Arc::new(TtsProcessor::new(synth.clone(), storage.clone())),
        JobType::Avatar => Arc::new(AvatarProcessor::new(synth.clone(), storage.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, RenderingCache};
    use crate::pipeline::PipelineConfig;
    use render_media::{MediaResult, ProgressSink, StageRequest, StageRunner};
    use render_models::{AudioEffect, JobId, Priority, RenderSettings, VideoConfig};
    use render_storage::{LocalStorage, LocalStorageConfig};
    use render_synth::SynthError;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeSynth {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl SynthBackend for FakeSynth {
        async fn synthesize_speech(&self, _request: &TtsRequest) -> SynthResult<SynthesizedMedia> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(SynthError::ServiceUnavailable("503".to_string()));
            }
            Ok(SynthesizedMedia {
                bytes: vec![7u8; 32],
                content_type: "audio/mpeg".to_string(),
                duration_secs: Some(1.5),
            })
        }

        async fn render_avatar(&self, _request: &AvatarRequest) -> SynthResult<SynthesizedMedia> {
            Err(SynthError::Rejected {
                status: 404,
                body: "unknown avatar".to_string(),
            })
        }
    }

    fn job(job_type: JobType, config: serde_json::Value) -> Job {
        let config = match job_type {
            JobType::Tts => JobConfig::Tts(serde_json::from_value(config).unwrap()),
            JobType::Avatar => JobConfig::Avatar(serde_json::from_value(config).unwrap()),
            JobType::Video => JobConfig::Video(serde_json::from_value(config).unwrap()),
        };
        Job::new(job_type, Priority::Normal, config, None, 1, 3)
    }

    fn context() -> (JobContext, mpsc::UnboundedReceiver<u8>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = PipelineControl::new();
        control.start();
        let logger = JobLogger::new(&JobId::new(), JobType::Tts, 1);
        (JobContext::new(control, logger, tx), rx)
    }

    fn storage(dir: &TempDir) -> Arc<dyn ObjectStorage> {
        Arc::new(LocalStorage::new(LocalStorageConfig {
            root: dir.path().to_path_buf(),
            public_url: None,
        }))
    }

    #[tokio::test]
    async fn test_tts_uploads_synthesized_audio() {
        let dir = TempDir::new().unwrap();
        let processor = TtsProcessor::new(
            Arc::new(FakeSynth {
                delay: Duration::ZERO,
                fail: false,
            }),
            storage(&dir),
        );
        let job = job(JobType::Tts, serde_json::json!({"text": "Olá"}));
        let (ctx, mut progress) = context();

        let result = processor.process(&job, &ctx).await.unwrap();
        assert_eq!(result.size_bytes, 32);
        assert_eq!(result.duration_secs, Some(1.5));
        assert!(result.artifact_url.ends_with(&format!("renders/tts/{}.mp3", job.id)));
        assert_eq!(progress.recv().await, Some(10));
        assert_eq!(progress.recv().await, Some(80));
    }

    #[tokio::test]
    async fn test_synthesis_is_abandoned_on_cancel() {
        let dir = TempDir::new().unwrap();
        let processor = TtsProcessor::new(
            Arc::new(FakeSynth {
                delay: Duration::from_secs(30),
                fail: false,
            }),
            storage(&dir),
        );
        let job = job(JobType::Tts, serde_json::json!({"text": "Olá"}));
        let (ctx, _progress) = context();

        let control = ctx.control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            control.cancel();
        });

        let err = processor.process(&job, &ctx).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_synthesis_errors_keep_retryability() {
        let dir = TempDir::new().unwrap();
        let synth = Arc::new(FakeSynth {
            delay: Duration::ZERO,
            fail: true,
        });
        let (ctx, _progress) = context();

        let tts = TtsProcessor::new(synth.clone(), storage(&dir));
        let err = tts
            .process(&job(JobType::Tts, serde_json::json!({"text": "Olá"})), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.failed_stage(), Some("synthesis"));

        let avatar = AvatarProcessor::new(synth, storage(&dir));
        let avatar_job = job(
            JobType::Avatar,
            serde_json::json!({"avatarId": "ghost", "text": "hi", "output": {}}),
        );
        let err = avatar.process(&avatar_job, &ctx).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_synthesis_call_keeps_job_alive() {
        let dir = TempDir::new().unwrap();
        let processor = TtsProcessor::new(
            Arc::new(FakeSynth {
                delay: Duration::from_millis(100),
                fail: false,
            }),
            storage(&dir),
        );
        let job = job(JobType::Tts, serde_json::json!({"text": "Olá"}));
        let (ctx, _progress) = context();
        let quiet = ctx.quiet_calls();
        assert!(!quiet.in_flight());

        let observe = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            quiet.in_flight()
        };
        let (result, during) = tokio::join!(processor.process(&job, &ctx), observe);

        result.unwrap();
        assert!(during);
        assert!(!quiet.in_flight());
    }

    /// Copies input to output, counting stage runs.
    #[derive(Default)]
    struct CopyRunner {
        runs: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl StageRunner for CopyRunner {
        async fn run_stage(&self, request: &StageRequest, progress: &dyn ProgressSink) -> MediaResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::fs::copy(&request.input, &request.output).await?;
            progress.report(100.0).await
        }
    }

    #[tokio::test]
    async fn test_identical_video_job_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("clip.mp4");
        tokio::fs::write(&source, b"frames").await.unwrap();

        let cache = Arc::new(
            RenderingCache::open(CacheConfig {
                dir: dir.path().join("cache"),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let runner = Arc::new(CopyRunner::default());
        let pipeline = Arc::new(RenderingPipeline::new(
            runner.clone(),
            Some(cache),
            PipelineConfig::new(dir.path().join("work")),
        ));
        let processor = VideoProcessor::new(pipeline, storage(&dir), dir.path().join("out"));

        let config = VideoConfig {
            source: source.display().to_string(),
            scenes: Vec::new(),
            settings: RenderSettings {
                audio_enhancements: vec![AudioEffect::normalize().into()],
                ..Default::default()
            },
        };
        let submit = || Job::new(JobType::Video, Priority::Normal, JobConfig::Video(config.clone()), None, 1, 3);

        let (ctx, _progress) = context();
        let first = processor.process(&submit(), &ctx).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.size_bytes, 6);

        let (ctx, _progress) = context();
        let second = processor.process(&submit(), &ctx).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.size_bytes, 6);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_config_is_invalid() {
        let dir = TempDir::new().unwrap();
        let processor = AvatarProcessor::new(
            Arc::new(FakeSynth {
                delay: Duration::ZERO,
                fail: false,
            }),
            storage(&dir),
        );
        let (ctx, _progress) = context();
        let err = processor
            .process(&job(JobType::Tts, serde_json::json!({"text": "x"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidJob(_)));
    }
}
