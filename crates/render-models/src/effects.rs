//! Audio enhancements, visual filters, watermark and subtitle specs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One entry of a job's audio enhancement list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AudioEnhancement {
    #[serde(flatten)]
    pub effect: AudioEffect,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AudioEnhancement {
    pub fn new(effect: AudioEffect) -> Self {
        Self { effect, enabled: true }
    }
}

impl From<AudioEffect> for AudioEnhancement {
    fn from(effect: AudioEffect) -> Self {
        Self::new(effect)
    }
}

/// Audio effect with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioEffect {
    /// EBU R128 loudness normalization.
    Normalize {
        #[serde(rename = "targetLufs", default = "default_target_lufs")]
        target_lufs: f64,
    },
    Compression {
        #[serde(rename = "thresholdDb", default = "default_threshold_db")]
        threshold_db: f64,
        #[serde(default = "default_ratio")]
        ratio: f64,
        #[serde(rename = "attackMs", default = "default_attack_ms")]
        attack_ms: f64,
        #[serde(rename = "releaseMs", default = "default_release_ms")]
        release_ms: f64,
    },
    /// Strength in 0..=1.
    NoiseReduction {
        #[serde(default = "default_strength")]
        strength: f64,
    },
    FadeIn {
        #[serde(rename = "durationSecs", default = "default_fade_secs")]
        duration_secs: f64,
    },
    FadeOut {
        #[serde(rename = "durationSecs", default = "default_fade_secs")]
        duration_secs: f64,
    },
    /// Three-band equalizer, gains in dB.
    Equalizer {
        #[serde(default)]
        bass: f64,
        #[serde(default)]
        mid: f64,
        #[serde(default)]
        treble: f64,
    },
    BassBoost {
        #[serde(rename = "gainDb", default = "default_boost_db")]
        gain_db: f64,
    },
    TrebleBoost {
        #[serde(rename = "gainDb", default = "default_boost_db")]
        gain_db: f64,
    },
    Volume {
        #[serde(rename = "gainDb", default)]
        gain_db: f64,
    },
}

impl AudioEffect {
    pub fn name(&self) -> &'static str {
        match self {
            AudioEffect::Normalize { .. } => "normalize",
            AudioEffect::Compression { .. } => "compression",
            AudioEffect::NoiseReduction { .. } => "noise_reduction",
            AudioEffect::FadeIn { .. } => "fade_in",
            AudioEffect::FadeOut { .. } => "fade_out",
            AudioEffect::Equalizer { .. } => "equalizer",
            AudioEffect::BassBoost { .. } => "bass_boost",
            AudioEffect::TrebleBoost { .. } => "treble_boost",
            AudioEffect::Volume { .. } => "volume",
        }
    }

    /// Normalization with the default loudness target.
    pub fn normalize() -> Self {
        AudioEffect::Normalize {
            target_lufs: default_target_lufs(),
        }
    }
}

/// Visual filter applied in the `video_filters` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VideoFilter {
    /// Range -1.0..=1.0, 0 is neutral.
    Brightness { value: f64 },
    /// 1.0 is neutral.
    Contrast { value: f64 },
    /// 1.0 is neutral, 0 is grayscale.
    Saturation { value: f64 },
    Hue { degrees: f64 },
    Blur { radius: f64 },
    Sharpen { amount: f64 },
    Grayscale,
    Sepia,
    Vignette,
    Denoise {
        #[serde(default = "default_denoise")]
        strength: f64,
    },
}

impl VideoFilter {
    pub fn name(&self) -> &'static str {
        match self {
            VideoFilter::Brightness { .. } => "brightness",
            VideoFilter::Contrast { .. } => "contrast",
            VideoFilter::Saturation { .. } => "saturation",
            VideoFilter::Hue { .. } => "hue",
            VideoFilter::Blur { .. } => "blur",
            VideoFilter::Sharpen { .. } => "sharpen",
            VideoFilter::Grayscale => "grayscale",
            VideoFilter::Sepia => "sepia",
            VideoFilter::Vignette => "vignette",
            VideoFilter::Denoise { .. } => "denoise",
        }
    }
}

/// Where a watermark is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
}

/// Image or text watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatermarkContent {
    Image {
        path: String,
        /// Watermark width as a fraction of the video width.
        #[serde(default = "default_watermark_scale")]
        scale: f64,
    },
    Text {
        text: String,
        #[serde(rename = "fontSize", default = "default_font_size")]
        font_size: u32,
        #[serde(default = "default_text_color")]
        color: String,
        #[serde(rename = "fontFile", default)]
        font_file: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkSpec {
    #[serde(flatten)]
    pub content: WatermarkContent,
    #[serde(default)]
    pub position: WatermarkPosition,
    /// 0.0..=1.0
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    /// Distance from the anchored edges, in pixels.
    #[serde(default = "default_margin")]
    pub margin: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Burn into the picture; otherwise mux as a soft track.
    #[serde(default = "default_true")]
    pub burn_in: bool,
    /// Path to an SRT/ASS/VTT file.
    pub source: String,
    #[serde(default)]
    pub style: Option<SubtitleStyle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleStyle {
    #[serde(default = "default_font_name")]
    pub font_name: String,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    /// `#RRGGBB`
    #[serde(default = "default_text_color")]
    pub primary_color: String,
    #[serde(default = "default_outline_color")]
    pub outline_color: String,
    #[serde(default = "default_outline")]
    pub outline: u32,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            font_name: default_font_name(),
            font_size: default_font_size(),
            primary_color: default_text_color(),
            outline_color: default_outline_color(),
            outline: default_outline(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_target_lufs() -> f64 {
    -16.0
}
fn default_threshold_db() -> f64 {
    -20.0
}
fn default_ratio() -> f64 {
    4.0
}
fn default_attack_ms() -> f64 {
    20.0
}
fn default_release_ms() -> f64 {
    250.0
}
fn default_strength() -> f64 {
    0.5
}
fn default_fade_secs() -> f64 {
    1.0
}
fn default_boost_db() -> f64 {
    6.0
}
fn default_denoise() -> f64 {
    4.0
}
fn default_watermark_scale() -> f64 {
    0.15
}
fn default_font_size() -> u32 {
    24
}
fn default_text_color() -> String {
    "#FFFFFF".to_string()
}
fn default_outline_color() -> String {
    "#000000".to_string()
}
fn default_font_name() -> String {
    "Arial".to_string()
}
fn default_outline() -> u32 {
    2
}
fn default_opacity() -> f64 {
    0.8
}
fn default_margin() -> u32 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_enhancement_defaults() {
        let e: AudioEnhancement = serde_json::from_str(r#"{"type":"normalize"}"#).unwrap();
        assert!(e.enabled);
        assert_eq!(e.effect, AudioEffect::Normalize { target_lufs: -16.0 });

        let e: AudioEnhancement =
            serde_json::from_str(r#"{"type":"fade_out","durationSecs":2.5,"enabled":false}"#).unwrap();
        assert!(!e.enabled);
        assert_eq!(e.effect, AudioEffect::FadeOut { duration_secs: 2.5 });
    }

    #[test]
    fn test_video_filter_tagging() {
        let f: VideoFilter = serde_json::from_str(r#"{"type":"grayscale"}"#).unwrap();
        assert_eq!(f, VideoFilter::Grayscale);

        let f: VideoFilter = serde_json::from_str(r#"{"type":"brightness","value":0.2}"#).unwrap();
        assert_eq!(f.name(), "brightness");
    }

    #[test]
    fn test_watermark_spec_parsing() {
        let spec: WatermarkSpec = serde_json::from_str(
            r#"{"kind":"text","text":"DRAFT","fontSize":32,"position":"top_left"}"#,
        )
        .unwrap();
        assert_eq!(spec.position, WatermarkPosition::TopLeft);
        assert!((spec.opacity - 0.8).abs() < f64::EPSILON);
        match spec.content {
            WatermarkContent::Text { text, font_size, .. } => {
                assert_eq!(text, "DRAFT");
                assert_eq!(font_size, 32);
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_subtitle_spec_defaults() {
        let spec: SubtitleSpec = serde_json::from_str(r#"{"source":"subs.srt"}"#).unwrap();
        assert!(!spec.enabled);
        assert!(spec.burn_in);
        assert!(spec.style.is_none());
    }
}
