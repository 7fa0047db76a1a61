//! Pipeline stage runners.
//!
//! A stage takes one input file and produces one output file. The
//! [`StageRunner`] trait is the seam the pipeline drives; [`FfmpegStageRunner`]
//! is the production implementation.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use render_models::{EncodingProfile, OutputFormat, RenderSettings, StageKind};

use crate::audio::build_audio_filter_chain;
use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::filters::build_video_filter_chain;
use crate::probe::{probe_media, MediaInfo};
use crate::progress::ProgressSink;
use crate::subtitles::burn_in_filter;
use crate::watermark::{build_watermark_graph, WatermarkGraph};

/// One stage invocation.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage: StageKind,
    pub input: PathBuf,
    pub output: PathBuf,
    pub settings: RenderSettings,
}

/// Runs a single media operation, reporting fractional progress.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(&self, request: &StageRequest, progress: &dyn ProgressSink) -> MediaResult<()>;
}

/// Stage runner backed by the `ffmpeg` CLI.
#[derive(Debug, Clone, Default)]
pub struct FfmpegStageRunner {
    runner: FfmpegRunner,
}

impl FfmpegStageRunner {
    pub fn new(runner: FfmpegRunner) -> Self {
        Self { runner }
    }

    /// Build the FFmpeg invocation for a stage.
    pub fn build_command(&self, request: &StageRequest, info: &MediaInfo) -> MediaResult<FfmpegCommand> {
        let settings = &request.settings;
        let format = settings.output.format;
        let profile = EncodingProfile::from(&settings.output);
        let cmd = FfmpegCommand::new(&request.input, &request.output);

        let cmd = match request.stage {
            StageKind::AudioProcessing => {
                if !info.has_audio {
                    return Err(MediaError::Unsupported(
                        "audio processing requested but input has no audio stream".to_string(),
                    ));
                }
                let chain = build_audio_filter_chain(settings.active_audio_enhancements(), info.duration)
                    .ok_or_else(|| MediaError::Unsupported("no enabled audio enhancements".to_string()))?;
                let cmd = cmd.audio_filter(chain).encode_audio(&profile);
                if !info.has_video {
                    cmd
                } else if can_copy_streams(format) {
                    cmd.video_codec("copy")
                } else {
                    cmd.encode_video(&profile)
                }
            }
            StageKind::VideoFilters => {
                require_video(info, request.stage)?;
                let chain = build_video_filter_chain(&settings.video_filters, &profile);
                let cmd = cmd.video_filter(chain).encode_video(&profile);
                pass_audio(cmd, info, format, &profile)
            }
            StageKind::Watermark => {
                require_video(info, request.stage)?;
                let spec = settings
                    .watermark
                    .as_ref()
                    .ok_or_else(|| MediaError::Unsupported("watermark stage without spec".to_string()))?;
                let cmd = match build_watermark_graph(spec) {
                    WatermarkGraph::Simple(filter) => cmd.video_filter(filter),
                    WatermarkGraph::Overlay { image, filter_complex } => {
                        require_file(Path::new(&image))?;
                        cmd.add_input(&image)
                            .filter_complex(filter_complex)
                            .output_args(["-map", "[out]", "-map", "0:a?"])
                    }
                };
                pass_audio(cmd.encode_video(&profile), info, format, &profile)
            }
            StageKind::Subtitles => {
                let spec = settings
                    .subtitles
                    .as_ref()
                    .ok_or_else(|| MediaError::Unsupported("subtitle stage without spec".to_string()))?;
                require_file(Path::new(&spec.source))?;
                if spec.burn_in {
                    require_video(info, request.stage)?;
                    let cmd = cmd.video_filter(burn_in_filter(spec)).encode_video(&profile);
                    pass_audio(cmd, info, format, &profile)
                } else {
                    let cmd = cmd
                        .add_input(&spec.source)
                        .output_args(["-map", "0:v?", "-map", "0:a?", "-map", "1:0"]);
                    let cmd = if can_copy_streams(format) {
                        cmd.video_codec("copy").audio_codec("copy")
                    } else {
                        cmd.encode_video(&profile).encode_audio(&profile)
                    };
                    cmd.output_arg("-c:s").output_arg(format.subtitle_codec())
                }
            }
        };

        Ok(match format {
            OutputFormat::Mp4 | OutputFormat::Mov => cmd.output_args(["-movflags", "+faststart"]),
            OutputFormat::Webm => cmd,
        })
    }
}

#[async_trait]
impl StageRunner for FfmpegStageRunner {
    async fn run_stage(&self, request: &StageRequest, progress: &dyn ProgressSink) -> MediaResult<()> {
        let info = probe_media(&request.input).await?;
        let cmd = self.build_command(request, &info)?;

        debug!(
            stage = request.stage.as_str(),
            input = %request.input.display(),
            output = %request.output.display(),
            "Running stage"
        );

        self.runner
            .run_with_progress(&cmd, info.duration_ms(), progress)
            .await?;

        if !request.output.exists() {
            return Err(MediaError::ffmpeg_failed(
                format!("{} produced no output", request.stage),
                None,
                None,
            ));
        }

        progress.report(100.0).await?;
        info!(stage = request.stage.as_str(), "Stage finished");
        Ok(())
    }
}

/// Containers that accept the H.264/AAC streams of an intermediate unchanged.
fn can_copy_streams(format: OutputFormat) -> bool {
    matches!(format, OutputFormat::Mp4 | OutputFormat::Mov)
}

fn pass_audio(
    cmd: FfmpegCommand,
    info: &MediaInfo,
    format: OutputFormat,
    profile: &EncodingProfile,
) -> FfmpegCommand {
    if !info.has_audio {
        cmd.output_arg("-an")
    } else if can_copy_streams(format) {
        cmd.audio_codec("copy")
    } else {
        cmd.encode_audio(profile)
    }
}

fn require_video(info: &MediaInfo, stage: StageKind) -> MediaResult<()> {
    if info.has_video {
        Ok(())
    } else {
        Err(MediaError::Unsupported(format!("{} requires a video stream", stage)))
    }
}

fn require_file(path: &Path) -> MediaResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(MediaError::FileNotFound(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_models::{
        AudioEffect, SubtitleSpec, VideoFilter, WatermarkContent, WatermarkPosition, WatermarkSpec,
    };

    fn av_info() -> MediaInfo {
        MediaInfo {
            duration: 10.0,
            width: 1280,
            height: 720,
            fps: 30.0,
            has_video: true,
            has_audio: true,
            size: 0,
        }
    }

    fn request(stage: StageKind, settings: RenderSettings) -> StageRequest {
        StageRequest {
            stage,
            input: PathBuf::from("/work/in.mp4"),
            output: PathBuf::from("/work/out.mp4"),
            settings,
        }
    }

    fn args_of(stage: StageKind, settings: RenderSettings, info: &MediaInfo) -> MediaResult<Vec<String>> {
        FfmpegStageRunner::default()
            .build_command(&request(stage, settings), info)
            .map(|c| c.build_args())
    }

    #[test]
    fn test_audio_stage_copies_video() {
        let mut settings = RenderSettings::default();
        settings.audio_enhancements = vec![AudioEffect::normalize().into()];
        let args = args_of(StageKind::AudioProcessing, settings, &av_info()).unwrap();
        let af = args.iter().position(|a| a == "-af").unwrap();
        assert!(args[af + 1].starts_with("loudnorm"));
        let cv = args.iter().position(|a| a == "-c:v").unwrap();
        assert_eq!(args[cv + 1], "copy");
    }

    #[test]
    fn test_audio_stage_rejects_silent_input() {
        let mut settings = RenderSettings::default();
        settings.audio_enhancements = vec![AudioEffect::normalize().into()];
        let info = MediaInfo { has_audio: false, ..av_info() };
        assert!(matches!(
            args_of(StageKind::AudioProcessing, settings, &info),
            Err(MediaError::Unsupported(_))
        ));
    }

    #[test]
    fn test_filter_stage_copies_audio() {
        let mut settings = RenderSettings::default();
        settings.video_filters = vec![VideoFilter::Grayscale];
        let args = args_of(StageKind::VideoFilters, settings, &av_info()).unwrap();
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert!(args[vf + 1].starts_with("hue=s=0"));
        let ca = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[ca + 1], "copy");
        assert!(args.contains(&"+faststart".to_string()));
    }

    #[test]
    fn test_text_watermark_stage() {
        let mut settings = RenderSettings::default();
        settings.watermark = Some(WatermarkSpec {
            content: WatermarkContent::Text {
                text: "PREVIEW".to_string(),
                font_size: 24,
                color: "#FFFFFF".to_string(),
                font_file: None,
            },
            position: WatermarkPosition::BottomRight,
            opacity: 0.8,
            margin: 20,
        });
        let args = args_of(StageKind::Watermark, settings, &av_info()).unwrap();
        assert!(args.iter().any(|a| a.starts_with("drawtext=")));
    }

    #[test]
    fn test_missing_watermark_image_is_not_found() {
        let mut settings = RenderSettings::default();
        settings.watermark = Some(WatermarkSpec {
            content: WatermarkContent::Image {
                path: "/definitely/missing/logo.png".to_string(),
                scale: 0.1,
            },
            position: WatermarkPosition::TopLeft,
            opacity: 1.0,
            margin: 0,
        });
        assert!(matches!(
            args_of(StageKind::Watermark, settings, &av_info()),
            Err(MediaError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_soft_subtitles_map_track() {
        let dir = tempfile::TempDir::new().unwrap();
        let subs = dir.path().join("subs.srt");
        std::fs::write(&subs, "1\n00:00:00,000 --> 00:00:01,000\nHi\n").unwrap();

        let mut settings = RenderSettings::default();
        settings.subtitles = Some(SubtitleSpec {
            enabled: true,
            burn_in: false,
            source: subs.to_string_lossy().to_string(),
            style: None,
        });
        let args = args_of(StageKind::Subtitles, settings, &av_info()).unwrap();
        assert!(args.contains(&"mov_text".to_string()));
        assert!(args.contains(&"1:0".to_string()));
    }
}
