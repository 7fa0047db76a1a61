//! Multi-stage rendering pipeline.
//!
//! Runs the enabled stages of a [`RenderSettings`] strictly in order
//! (audio, filters, watermark, subtitles), each stage reading the previous
//! stage's output. Every execution owns a private working directory that is
//! removed on all exit paths. Finished outputs are stored in the
//! [`RenderingCache`] and served from it on identical re-runs.

mod control;
mod eta;

pub use control::{PipelineControl, PipelineState};
pub use eta::EtaEstimator;

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use render_media::fs_utils::{copy_file, move_file, remove_if_exists};
use render_media::{MediaError, MediaResult, ProgressSink, StageRequest, StageRunner};
use render_models::{RenderSettings, StageKind};

use crate::cache::{CacheKey, RenderingCache};
use crate::metrics;
use crate::retry::{retry_async_if, RetryPolicy, RetryResult};

/// Stage name recorded when the final output is missing or empty.
pub const VALIDATION_STAGE: &str = "validation";

/// Progress of a running execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineProgress {
    pub stage: String,
    pub stage_percent: f64,
    pub overall_percent: f64,
    /// Advisory.
    pub eta_secs: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStageResult {
    pub stage: String,
    /// Excludes paused time.
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed,
    /// Served from the cache without running any stage.
    Cached,
    Failed {
        stage: String,
        error: String,
        /// Another attempt would fail the same way.
        permanent: bool,
    },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub outcome: PipelineOutcome,
    pub output_path: Option<PathBuf>,
    pub stages: Vec<PipelineStageResult>,
    /// Wall time minus paused time.
    pub total_duration: Duration,
    pub paused_duration: Duration,
    /// Extra attempts summed across stages.
    pub retry_attempts: u32,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Completed | PipelineOutcome::Cached)
    }

    pub fn cached(&self) -> bool {
        self.outcome == PipelineOutcome::Cached
    }

    pub fn cancelled(&self) -> bool {
        self.outcome == PipelineOutcome::Cancelled
    }

    pub fn failed_stage(&self) -> Option<&str> {
        match &self.outcome {
            PipelineOutcome::Failed { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parent of the per-execution working directories.
    pub work_dir: PathBuf,
    /// Applied to every stage.
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            retry: RetryPolicy::new("stage"),
        }
    }
}

pub struct RenderingPipeline {
    runner: Arc<dyn StageRunner>,
    cache: Option<Arc<RenderingCache>>,
    config: PipelineConfig,
}

/// Accumulates the result while an execution runs.
struct Run {
    started: Instant,
    stages: Vec<PipelineStageResult>,
    retry_attempts: u32,
}

impl Run {
    fn finish(self, outcome: PipelineOutcome, output: Option<&Path>, control: &PipelineControl) -> PipelineResult {
        let state = match &outcome {
            PipelineOutcome::Completed | PipelineOutcome::Cached => PipelineState::Completed,
            PipelineOutcome::Failed { .. } => PipelineState::Failed,
            PipelineOutcome::Cancelled => PipelineState::Cancelled,
        };
        control.finish(state);

        let paused_duration = control.paused_duration();
        PipelineResult {
            output_path: match outcome {
                PipelineOutcome::Completed | PipelineOutcome::Cached => output.map(Path::to_path_buf),
                _ => None,
            },
            outcome,
            stages: self.stages,
            total_duration: self.started.elapsed().saturating_sub(paused_duration),
            paused_duration,
            retry_attempts: self.retry_attempts,
        }
    }
}

impl RenderingPipeline {
    pub fn new(
        runner: Arc<dyn StageRunner>,
        cache: Option<Arc<RenderingCache>>,
        config: PipelineConfig,
    ) -> Self {
        Self { runner, cache, config }
    }

    /// Run the pipeline for one input.
    ///
    /// Never returns an error: failures and cancellation are reported
    /// through [`PipelineResult::outcome`].
    pub async fn execute(
        &self,
        input: &Path,
        output: &Path,
        settings: &RenderSettings,
        control: &PipelineControl,
        progress: Option<mpsc::UnboundedSender<PipelineProgress>>,
    ) -> PipelineResult {
        let mut run = Run {
            started: Instant::now(),
            stages: Vec::new(),
            retry_attempts: 0,
        };

        // The caller may already have started the control.
        control.start();
        if control.checkpoint().await.is_err() {
            debug!("Pipeline cancelled before start");
            return run.finish(PipelineOutcome::Cancelled, None, control);
        }

        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            let error = MediaError::FileNotFound(input.to_path_buf());
            return run.finish(
                PipelineOutcome::Failed {
                    stage: "input".to_string(),
                    error: error.to_string(),
                    permanent: true,
                },
                None,
                control,
            );
        }

        let cache_key = self.cache_key(input, settings).await;
        if let Some(key) = &cache_key {
            if self.serve_cached(key, output).await {
                info!(key = %key.key, "Pipeline served from cache");
                return run.finish(PipelineOutcome::Cached, Some(output), control);
            }
        }

        let stages = settings.enabled_stages();
        if stages.is_empty() {
            let outcome = match self.passthrough(input, output, control).await {
                Ok(()) => PipelineOutcome::Completed,
                Err(MediaError::Cancelled) => PipelineOutcome::Cancelled,
                Err(e) => PipelineOutcome::Failed {
                    stage: "copy".to_string(),
                    permanent: e.is_permanent(),
                    error: e.to_string(),
                },
            };
            return run.finish(outcome, Some(output), control);
        }

        let workspace = match self.workspace().await {
            Ok(dir) => dir,
            Err(e) => {
                return run.finish(
                    PipelineOutcome::Failed {
                        stage: "setup".to_string(),
                        error: e.to_string(),
                        permanent: false,
                    },
                    None,
                    control,
                )
            }
        };

        let outcome = self
            .run_stages(&mut run, &stages, input, output, settings, workspace.path(), control, progress.as_ref())
            .await;
        // Removes any intermediates left behind.
        drop(workspace);

        if outcome == PipelineOutcome::Completed {
            if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                let active_ms = run.started.elapsed().saturating_sub(control.paused_duration()).as_millis() as u64;
                if let Err(e) = cache.set(key, output, active_ms).await {
                    warn!(key = %key.key, "Failed to cache render output: {}", e);
                }
            }
        }

        run.finish(outcome, Some(output), control)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        run: &mut Run,
        stages: &[StageKind],
        input: &Path,
        output: &Path,
        settings: &RenderSettings,
        workspace: &Path,
        control: &PipelineControl,
        progress: Option<&mpsc::UnboundedSender<PipelineProgress>>,
    ) -> PipelineOutcome {
        let extension = settings.output.format.extension();
        let eta = Mutex::new(EtaEstimator::new());
        let mut current = input.to_path_buf();

        for (index, &stage) in stages.iter().enumerate() {
            if control.checkpoint().await.is_err() {
                return PipelineOutcome::Cancelled;
            }

            let stage_output = workspace.join(format!("{:02}_{}.{}", index, stage, extension));
            let request = StageRequest {
                stage,
                input: current.clone(),
                output: stage_output.clone(),
                settings: settings.clone(),
            };
            let sink = StageSink {
                control,
                eta: &eta,
                progress,
                stage,
                index,
                total: stages.len(),
            };

            if let Ok(mut eta) = eta.lock() {
                eta.start_stage();
            }
            sink.emit(0.0);

            let stage_started = Instant::now();
            let paused_before = control.paused_duration();
            let result = self.run_stage_with_retry(&request, &sink, control).await;
            let paused = control.paused_duration().saturating_sub(paused_before);
            let active = stage_started.elapsed().saturating_sub(paused);

            let attempts = result.attempts();
            run.retry_attempts += attempts.saturating_sub(1);

            match result.into_result() {
                Ok(()) => {
                    metrics::record_stage(stage.as_str(), active.as_secs_f64(), true);
                    run.stages.push(PipelineStageResult {
                        stage: stage.to_string(),
                        duration_ms: active.as_millis() as u64,
                        success: true,
                        error: None,
                        attempts,
                    });
                    if let Ok(mut eta) = eta.lock() {
                        eta.complete_stage(active);
                    }
                    sink.emit(100.0);
                    debug!(stage = %stage, duration_ms = active.as_millis() as u64, attempts, "Stage complete");

                    if current != input {
                        if let Err(e) = remove_if_exists(&current).await {
                            debug!("Failed to remove intermediate {}: {}", current.display(), e);
                        }
                    }
                    current = stage_output;
                }
                Err(e) if e.is_cancelled() => {
                    info!(stage = %stage, "Pipeline cancelled");
                    return PipelineOutcome::Cancelled;
                }
                Err(e) => {
                    let error = e.detailed_message();
                    metrics::record_stage(stage.as_str(), active.as_secs_f64(), false);
                    warn!(stage = %stage, attempts, "Stage failed: {}", error);
                    run.stages.push(PipelineStageResult {
                        stage: stage.to_string(),
                        duration_ms: active.as_millis() as u64,
                        success: false,
                        error: Some(error.clone()),
                        attempts,
                    });
                    return PipelineOutcome::Failed {
                        stage: stage.to_string(),
                        error,
                        permanent: e.is_permanent(),
                    };
                }
            }
        }

        if control.checkpoint().await.is_err() {
            return PipelineOutcome::Cancelled;
        }
        if let Err(e) = move_file(&current, output).await {
            return PipelineOutcome::Failed {
                stage: VALIDATION_STAGE.to_string(),
                permanent: false,
                error: e.to_string(),
            };
        }

        match validate_output(output).await {
            Ok(()) => PipelineOutcome::Completed,
            Err(error) => {
                let _ = remove_if_exists(output).await;
                PipelineOutcome::Failed {
                    stage: VALIDATION_STAGE.to_string(),
                    error,
                    permanent: false,
                }
            }
        }
    }

    async fn run_stage_with_retry(
        &self,
        request: &StageRequest,
        sink: &StageSink<'_>,
        control: &PipelineControl,
    ) -> RetryResult<(), MediaError> {
        let policy = self.config.retry.named(request.stage.as_str());
        let runner = &self.runner;

        retry_async_if(
            &policy,
            |e: &MediaError| !e.is_cancelled() && !e.is_permanent(),
            || async move {
                control.checkpoint().await?;
                remove_if_exists(&request.output).await?;
                runner.run_stage(request, sink).await
            },
        )
        .await
    }

    async fn cache_key(&self, input: &Path, settings: &RenderSettings) -> Option<CacheKey> {
        let cache = self.cache.as_ref()?;
        let normalized = match serde_json::to_value(settings) {
            Ok(value) => value,
            Err(e) => {
                warn!("Cannot fingerprint render settings: {}", e);
                return None;
            }
        };
        match cache.generate_key(input, &normalized).await {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Cache key generation failed, rendering without cache: {}", e);
                None
            }
        }
    }

    async fn serve_cached(&self, key: &CacheKey, output: &Path) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        let hit = match cache.get(&key.key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key.key, "Cache lookup failed: {}", e);
                return false;
            }
        };
        let Some(path) = hit else {
            return false;
        };
        match copy_file(&path, output).await {
            Ok(_) => true,
            Err(e) => {
                warn!(key = %key.key, "Failed to copy cached artifact: {}", e);
                false
            }
        }
    }

    async fn passthrough(&self, input: &Path, output: &Path, control: &PipelineControl) -> MediaResult<()> {
        control.checkpoint().await?;
        copy_file(input, output).await?;
        validate_output(output).await.map_err(MediaError::InvalidMedia)
    }

    async fn workspace(&self) -> std::io::Result<tempfile::TempDir> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        tempfile::Builder::new()
            .prefix("pipeline-")
            .tempdir_in(&self.config.work_dir)
    }
}

async fn validate_output(output: &Path) -> Result<(), String> {
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(format!("Output is empty: {}", output.display())),
        Err(_) => Err(format!("Output missing: {}", output.display())),
    }
}

/// Progress sink for one stage: checkpoints the control, feeds the ETA
/// estimator and forwards typed progress events.
struct StageSink<'a> {
    control: &'a PipelineControl,
    eta: &'a Mutex<EtaEstimator>,
    progress: Option<&'a mpsc::UnboundedSender<PipelineProgress>>,
    stage: StageKind,
    index: usize,
    total: usize,
}

impl StageSink<'_> {
    fn emit(&self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        let remaining = self.total - self.index - 1;
        let eta_secs = match self.eta.lock() {
            Ok(mut eta) => {
                eta.record(percent, Instant::now());
                eta.estimate(remaining)
            }
            Err(_) => None,
        };

        let Some(tx) = self.progress else {
            return;
        };
        let overall = (self.index as f64 + percent / 100.0) / self.total as f64 * 100.0;
        let _ = tx.send(PipelineProgress {
            stage: self.stage.to_string(),
            stage_percent: percent,
            overall_percent: overall,
            eta_secs,
            message: format!("{} {:.0}%", self.stage, percent),
        });
    }
}

#[async_trait]
impl ProgressSink for StageSink<'_> {
    async fn report(&self, percent: f64) -> MediaResult<()> {
        self.control.checkpoint().await?;
        self.emit(percent);
        Ok(())
    }

    async fn cancelled(&self) {
        self.control.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_models::{AudioEffect, SubtitleSpec, VideoFilter, WatermarkSpec};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    use crate::cache::CacheConfig;

    /// Appends the stage name to the input bytes and records every call.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<StageKind>>,
        /// Stage that fails, and how many times before succeeding.
        fail: Option<(StageKind, u32, fn() -> MediaError)>,
        failures: AtomicU32,
        /// Progress reports per stage, with a sleep between them.
        slow_steps: u32,
    }

    impl RecordingRunner {
        fn calls(&self) -> Vec<StageKind> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StageRunner for RecordingRunner {
        async fn run_stage(&self, request: &StageRequest, progress: &dyn ProgressSink) -> MediaResult<()> {
            self.calls.lock().unwrap().push(request.stage);

            if let Some((stage, times, make_error)) = self.fail {
                if stage == request.stage && self.failures.fetch_add(1, Ordering::SeqCst) < times {
                    return Err(make_error());
                }
            }

            for step in 1..=self.slow_steps {
                tokio::time::sleep(Duration::from_millis(5)).await;
                progress.report(step as f64 * 100.0 / self.slow_steps as f64).await?;
            }

            let mut bytes = tokio::fs::read(&request.input).await?;
            bytes.extend_from_slice(format!("|{}", request.stage).as_bytes());
            tokio::fs::write(&request.output, bytes).await?;
            progress.report(100.0).await
        }
    }

    struct Fixture {
        dir: TempDir,
        input: PathBuf,
        output: PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.mp4");
        tokio::fs::write(&input, b"source").await.unwrap();
        let output = dir.path().join("out").join("final.mp4");
        Fixture { input, output, dir }
    }

    fn config(dir: &TempDir) -> PipelineConfig {
        PipelineConfig {
            work_dir: dir.path().join("work"),
            retry: RetryPolicy::new("stage").with_base_delay(Duration::from_millis(1)),
        }
    }

    fn audio_only() -> RenderSettings {
        RenderSettings {
            audio_enhancements: vec![AudioEffect::normalize().into()],
            ..Default::default()
        }
    }

    fn all_stages() -> RenderSettings {
        let watermark: WatermarkSpec =
            serde_json::from_value(serde_json::json!({"kind": "text", "text": "ACME"})).unwrap();
        RenderSettings {
            audio_enhancements: vec![AudioEffect::normalize().into()],
            video_filters: vec![VideoFilter::Grayscale],
            watermark: Some(watermark),
            subtitles: Some(SubtitleSpec {
                enabled: true,
                burn_in: true,
                source: "subs.srt".to_string(),
                style: None,
            }),
            ..Default::default()
        }
    }

    async fn work_dir_is_empty(dir: &TempDir) -> bool {
        let mut entries = tokio::fs::read_dir(dir.path().join("work")).await.unwrap();
        entries.next_entry().await.unwrap().is_none()
    }

    #[tokio::test]
    async fn test_stages_run_in_fixed_order() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner::default());
        let pipeline = RenderingPipeline::new(runner.clone(), None, config(&fx.dir));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = pipeline
            .execute(&fx.input, &fx.output, &all_stages(), &PipelineControl::new(), Some(tx))
            .await;

        assert_eq!(result.outcome, PipelineOutcome::Completed);
        assert_eq!(runner.calls(), StageKind::ORDER.to_vec());
        assert_eq!(result.stages.len(), 4);
        assert_eq!(result.retry_attempts, 0);
        assert_eq!(
            tokio::fs::read_to_string(&fx.output).await.unwrap(),
            "source|audio_processing|video_filters|watermark|subtitles"
        );
        assert!(work_dir_is_empty(&fx.dir).await);

        let mut last_overall = 0.0;
        while let Ok(event) = rx.try_recv() {
            assert!(event.overall_percent >= last_overall);
            last_overall = event.overall_percent;
        }
        assert!((last_overall - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stage_failure_aborts_pipeline() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner {
            fail: Some((StageKind::Watermark, u32::MAX, || {
                MediaError::ffmpeg_failed("exit 1", None, Some(1))
            })),
            ..Default::default()
        });
        let pipeline = RenderingPipeline::new(runner.clone(), None, config(&fx.dir));

        let result = pipeline
            .execute(&fx.input, &fx.output, &all_stages(), &PipelineControl::new(), None)
            .await;

        assert!(!result.success());
        assert_eq!(result.failed_stage(), Some("watermark"));
        assert_eq!(
            runner.calls(),
            vec![
                StageKind::AudioProcessing,
                StageKind::VideoFilters,
                StageKind::Watermark,
                StageKind::Watermark,
                StageKind::Watermark,
            ]
        );
        assert_eq!(result.retry_attempts, 2);
        assert!(!fx.output.exists());
        assert!(work_dir_is_empty(&fx.dir).await);
    }

    #[tokio::test]
    async fn test_disabled_stages_are_skipped() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner::default());
        let pipeline = RenderingPipeline::new(runner.clone(), None, config(&fx.dir));
        let settings = RenderSettings {
            audio_enhancements: vec![AudioEffect::normalize().into()],
            subtitles: Some(SubtitleSpec {
                enabled: true,
                burn_in: true,
                source: "subs.srt".to_string(),
                style: None,
            }),
            ..Default::default()
        };

        let result = pipeline
            .execute(&fx.input, &fx.output, &settings, &PipelineControl::new(), None)
            .await;

        assert!(result.success());
        assert_eq!(runner.calls(), vec![StageKind::AudioProcessing, StageKind::Subtitles]);
        let stages: Vec<&str> = result.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, vec!["audio_processing", "subtitles"]);
        assert_eq!(
            tokio::fs::read_to_string(&fx.output).await.unwrap(),
            "source|audio_processing|subtitles"
        );
    }

    #[tokio::test]
    async fn test_filter_failure_skips_later_stages() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner {
            fail: Some((StageKind::VideoFilters, u32::MAX, || {
                MediaError::ffmpeg_failed("Invalid filter graph", None, Some(1))
            })),
            ..Default::default()
        });
        let pipeline = RenderingPipeline::new(runner.clone(), None, config(&fx.dir));

        let result = pipeline
            .execute(&fx.input, &fx.output, &all_stages(), &PipelineControl::new(), None)
            .await;

        assert_eq!(result.failed_stage(), Some("video_filters"));
        let calls = runner.calls();
        assert_eq!(calls[0], StageKind::AudioProcessing);
        assert!(calls[1..].iter().all(|stage| *stage == StageKind::VideoFilters));
        assert!(!calls.contains(&StageKind::Watermark));
        assert!(!calls.contains(&StageKind::Subtitles));
        assert!(!fx.output.exists());
        assert!(work_dir_is_empty(&fx.dir).await);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner {
            fail: Some((StageKind::AudioProcessing, 1, || MediaError::Timeout(30))),
            ..Default::default()
        });
        let pipeline = RenderingPipeline::new(runner.clone(), None, config(&fx.dir));

        let result = pipeline
            .execute(&fx.input, &fx.output, &audio_only(), &PipelineControl::new(), None)
            .await;

        assert!(result.success());
        assert_eq!(result.retry_attempts, 1);
        assert_eq!(result.stages[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner {
            fail: Some((StageKind::AudioProcessing, u32::MAX, || {
                MediaError::Unsupported("no audio stream".to_string())
            })),
            ..Default::default()
        });
        let pipeline = RenderingPipeline::new(runner.clone(), None, config(&fx.dir));

        let result = pipeline
            .execute(&fx.input, &fx.output, &audio_only(), &PipelineControl::new(), None)
            .await;

        assert_eq!(runner.calls().len(), 1);
        assert!(matches!(result.outcome, PipelineOutcome::Failed { permanent: true, .. }));
    }

    #[tokio::test]
    async fn test_single_stage_then_cache_hit() {
        let fx = fixture().await;
        let cache = Arc::new(
            RenderingCache::open(CacheConfig {
                dir: fx.dir.path().join("cache"),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let runner = Arc::new(RecordingRunner::default());
        let pipeline = RenderingPipeline::new(runner.clone(), Some(cache.clone()), config(&fx.dir));

        let first = pipeline
            .execute(&fx.input, &fx.output, &audio_only(), &PipelineControl::new(), None)
            .await;
        assert_eq!(first.outcome, PipelineOutcome::Completed);
        assert_eq!(first.stages.len(), 1);
        assert_eq!(first.stages[0].stage, "audio_processing");

        let second_output = fx.dir.path().join("again.mp4");
        let second = pipeline
            .execute(&fx.input, &second_output, &audio_only(), &PipelineControl::new(), None)
            .await;
        assert!(second.cached());
        assert!(second.stages.is_empty());
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(
            tokio::fs::read(&second_output).await.unwrap(),
            tokio::fs::read(&fx.output).await.unwrap()
        );
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn test_no_stages_copies_input() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner::default());
        let pipeline = RenderingPipeline::new(runner.clone(), None, config(&fx.dir));

        let result = pipeline
            .execute(&fx.input, &fx.output, &RenderSettings::default(), &PipelineControl::new(), None)
            .await;

        assert!(result.success());
        assert!(runner.calls().is_empty());
        assert_eq!(tokio::fs::read(&fx.output).await.unwrap(), b"source");
    }

    #[tokio::test]
    async fn test_missing_input_fails_permanently() {
        let fx = fixture().await;
        let pipeline = RenderingPipeline::new(Arc::new(RecordingRunner::default()), None, config(&fx.dir));

        let result = pipeline
            .execute(
                &fx.dir.path().join("nope.mp4"),
                &fx.output,
                &audio_only(),
                &PipelineControl::new(),
                None,
            )
            .await;

        assert!(matches!(result.outcome, PipelineOutcome::Failed { permanent: true, .. }));
    }

    #[tokio::test]
    async fn test_pause_time_is_excluded() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner {
            slow_steps: 10,
            ..Default::default()
        });
        let pipeline = Arc::new(RenderingPipeline::new(runner, None, config(&fx.dir)));
        let control = PipelineControl::new();

        let handle = {
            let (pipeline, control) = (pipeline.clone(), control.clone());
            let (input, output) = (fx.input.clone(), fx.output.clone());
            tokio::spawn(async move {
                pipeline
                    .execute(&input, &output, &audio_only(), &control, None)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(control.pause());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(control.state(), PipelineState::Paused);
        assert!(control.resume());

        let result = handle.await.unwrap();
        assert!(result.success());
        assert!(result.paused_duration >= Duration::from_millis(80));
        assert!(result.stages[0].duration_ms < result.paused_duration.as_millis() as u64 + 200);
        assert_eq!(control.state(), PipelineState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_is_terminal_and_not_retried() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner {
            slow_steps: 50,
            ..Default::default()
        });
        let pipeline = Arc::new(RenderingPipeline::new(runner.clone(), None, config(&fx.dir)));
        let control = PipelineControl::new();

        let handle = {
            let (pipeline, control) = (pipeline.clone(), control.clone());
            let (input, output) = (fx.input.clone(), fx.output.clone());
            tokio::spawn(async move {
                pipeline
                    .execute(&input, &output, &all_stages(), &control, None)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(control.cancel());

        let result = handle.await.unwrap();
        assert!(result.cancelled());
        assert!(!result.success());
        assert_eq!(runner.calls(), vec![StageKind::AudioProcessing]);
        assert!(!fx.output.exists());
        assert!(work_dir_is_empty(&fx.dir).await);
        assert!(!control.resume());
        assert_eq!(control.state(), PipelineState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fx = fixture().await;
        let runner = Arc::new(RecordingRunner::default());
        let pipeline = RenderingPipeline::new(runner.clone(), None, config(&fx.dir));
        let control = PipelineControl::new();
        control.cancel();

        let result = pipeline
            .execute(&fx.input, &fx.output, &audio_only(), &control, None)
            .await;
        assert!(result.cancelled());
        assert!(runner.calls().is_empty());
    }
}
