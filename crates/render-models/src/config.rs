//! Per-type job configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::effects::{AudioEnhancement, SubtitleSpec, VideoFilter, WatermarkSpec};
use crate::encoding::OutputSettings;

/// Seconds of render time per scene at standard quality and 720p.
pub const SECONDS_PER_SCENE: f64 = 8.0;

/// Name of a pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    AudioProcessing,
    VideoFilters,
    Watermark,
    Subtitles,
}

impl StageKind {
    /// All stages in their fixed execution order.
    pub const ORDER: [StageKind; 4] = [
        StageKind::AudioProcessing,
        StageKind::VideoFilters,
        StageKind::Watermark,
        StageKind::Subtitles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::AudioProcessing => "audio_processing",
            StageKind::VideoFilters => "video_filters",
            StageKind::Watermark => "watermark",
            StageKind::Subtitles => "subtitles",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings that change the rendered output.
///
/// Everything in here participates in the cache fingerprint; anything that
/// does not affect output bytes belongs on the job config instead.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RenderSettings {
    pub output: OutputSettings,
    #[serde(default)]
    pub audio_enhancements: Vec<AudioEnhancement>,
    #[serde(default)]
    pub video_filters: Vec<VideoFilter>,
    #[serde(default)]
    pub watermark: Option<WatermarkSpec>,
    #[serde(default)]
    pub subtitles: Option<SubtitleSpec>,
}

impl RenderSettings {
    /// Enabled audio enhancements only.
    pub fn active_audio_enhancements(&self) -> impl Iterator<Item = &AudioEnhancement> {
        self.audio_enhancements.iter().filter(|e| e.enabled)
    }

    /// Stages this configuration activates, in execution order.
    pub fn enabled_stages(&self) -> Vec<StageKind> {
        StageKind::ORDER
            .into_iter()
            .filter(|stage| self.is_stage_enabled(*stage))
            .collect()
    }

    pub fn is_stage_enabled(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::AudioProcessing => self.active_audio_enhancements().next().is_some(),
            StageKind::VideoFilters => !self.video_filters.is_empty(),
            StageKind::Watermark => self.watermark.is_some(),
            StageKind::Subtitles => self.subtitles.as_ref().is_some_and(|s| s.enabled),
        }
    }
}

/// A scene of a composed video, used for estimating render cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

/// Video composition job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoConfig {
    /// Source media to process (local path).
    pub source: String,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(flatten)]
    pub settings: RenderSettings,
}

impl VideoConfig {
    /// Relative render cost: quality multiplier plus a resolution bump.
    pub fn complexity(&self) -> f64 {
        let output = &self.settings.output;
        output.quality.complexity() + output.resolution.complexity_bump()
    }

    /// Rough render time estimate in seconds.
    pub fn estimated_render_secs(&self) -> f64 {
        let units = if self.scenes.is_empty() {
            1.0
        } else {
            self.scenes.len() as f64
        };
        units * SECONDS_PER_SCENE * self.complexity()
    }
}

/// Audio encoding for synthesized speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Wav,
    Ogg,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Ogg => "ogg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Ogg => "audio/ogg",
        }
    }
}

/// Text-to-speech job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TtsConfig {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default)]
    pub format: AudioFormat,
}

impl TtsConfig {
    /// Roughly one second per 15 characters of text.
    pub fn estimated_render_secs(&self) -> f64 {
        (self.text.chars().count() as f64 / 15.0).max(1.0)
    }
}

fn default_speed() -> f64 {
    1.0
}

/// Talking-avatar job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AvatarConfig {
    pub avatar_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    pub output: OutputSettings,
}

impl AvatarConfig {
    pub fn estimated_render_secs(&self) -> f64 {
        let base = match &self.text {
            Some(text) => (text.chars().count() as f64 / 15.0).max(SECONDS_PER_SCENE),
            None => SECONDS_PER_SCENE * 4.0,
        };
        base * (self.output.quality.complexity() + self.output.resolution.complexity_bump())
    }
}

/// Typed job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobConfig {
    Video(VideoConfig),
    Tts(TtsConfig),
    Avatar(AvatarConfig),
}

impl JobConfig {
    pub fn estimated_render_secs(&self) -> f64 {
        match self {
            JobConfig::Video(c) => c.estimated_render_secs(),
            JobConfig::Tts(c) => c.estimated_render_secs(),
            JobConfig::Avatar(c) => c.estimated_render_secs(),
        }
    }
}
