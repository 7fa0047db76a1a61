//! Output encoding settings.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default video codec (H.264)
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
/// Default audio codec
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
/// Default audio bitrate
pub const DEFAULT_AUDIO_BITRATE: &str = "128k";
/// Default frame rate
pub const DEFAULT_FPS: u32 = 30;

/// Output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub enum Resolution {
    #[serde(rename = "720p")]
    #[default]
    Hd720,
    #[serde(rename = "1080p")]
    Hd1080,
    #[serde(rename = "1440p")]
    Qhd1440,
    #[serde(rename = "4k")]
    Uhd4k,
}

impl Resolution {
    /// Pixel dimensions (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Resolution::Hd720 => (1280, 720),
            Resolution::Hd1080 => (1920, 1080),
            Resolution::Qhd1440 => (2560, 1440),
            Resolution::Uhd4k => (3840, 2160),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Hd720 => "720p",
            Resolution::Hd1080 => "1080p",
            Resolution::Qhd1440 => "1440p",
            Resolution::Uhd4k => "4k",
        }
    }

    /// Extra render cost relative to 720p.
    pub fn complexity_bump(&self) -> f64 {
        match self {
            Resolution::Hd720 => 0.0,
            Resolution::Hd1080 => 0.2,
            Resolution::Qhd1440 | Resolution::Uhd4k => 0.4,
        }
    }
}

/// Quality tier requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Draft,
    #[default]
    Standard,
    High,
    Premium,
    Ultra,
}

impl QualityTier {
    /// Target video bitrate.
    pub fn video_bitrate(&self) -> &'static str {
        match self {
            QualityTier::Ultra => "8000k",
            QualityTier::Premium => "6000k",
            QualityTier::High => "5000k",
            QualityTier::Draft | QualityTier::Standard => "3000k",
        }
    }

    /// Constant rate factor (lower is better).
    pub fn crf(&self) -> u8 {
        match self {
            QualityTier::Draft => 28,
            QualityTier::Standard => 23,
            QualityTier::High => 20,
            QualityTier::Premium => 18,
            QualityTier::Ultra => 16,
        }
    }

    /// x264 preset.
    pub fn preset(&self) -> &'static str {
        match self {
            QualityTier::Draft => "ultrafast",
            QualityTier::Standard => "fast",
            QualityTier::High => "medium",
            QualityTier::Premium | QualityTier::Ultra => "slow",
        }
    }

    /// Render cost multiplier relative to `Standard`.
    pub fn complexity(&self) -> f64 {
        match self {
            QualityTier::Draft => 0.5,
            QualityTier::Standard => 1.0,
            QualityTier::High => 1.3,
            QualityTier::Premium => 1.8,
            QualityTier::Ultra => 2.5,
        }
    }
}

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Webm,
    Mov,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Mov => "mov",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "video/mp4",
            OutputFormat::Webm => "video/webm",
            OutputFormat::Mov => "video/quicktime",
        }
    }

    pub fn video_codec(&self) -> &'static str {
        match self {
            OutputFormat::Webm => "libvpx-vp9",
            OutputFormat::Mp4 | OutputFormat::Mov => DEFAULT_VIDEO_CODEC,
        }
    }

    pub fn audio_codec(&self) -> &'static str {
        match self {
            OutputFormat::Webm => "libopus",
            OutputFormat::Mp4 | OutputFormat::Mov => DEFAULT_AUDIO_CODEC,
        }
    }

    /// Codec used for soft subtitle tracks in this container.
    pub fn subtitle_codec(&self) -> &'static str {
        match self {
            OutputFormat::Webm => "webvtt",
            OutputFormat::Mp4 | OutputFormat::Mov => "mov_text",
        }
    }
}

/// Output settings block of a render job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutputSettings {
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub quality: QualityTier,
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            fps: DEFAULT_FPS,
            quality: QualityTier::default(),
            format: OutputFormat::default(),
        }
    }
}

fn default_fps() -> u32 {
    DEFAULT_FPS
}

/// Concrete encoder parameters resolved from [`OutputSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingProfile {
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    pub crf: u8,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl From<&OutputSettings> for EncodingProfile {
    fn from(settings: &OutputSettings) -> Self {
        let (width, height) = settings.resolution.dimensions();
        Self {
            video_codec: settings.format.video_codec().to_string(),
            audio_codec: settings.format.audio_codec().to_string(),
            preset: settings.quality.preset().to_string(),
            crf: settings.quality.crf(),
            video_bitrate: settings.quality.video_bitrate().to_string(),
            audio_bitrate: DEFAULT_AUDIO_BITRATE.to_string(),
            width,
            height,
            fps: settings.fps,
        }
    }
}
