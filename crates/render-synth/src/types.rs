//! Synthesis service request/response types.

use serde::{Deserialize, Serialize};

use render_models::{AudioFormat, AvatarConfig, OutputFormat, Resolution, TtsConfig};

/// Body of `POST /tts/synthesize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub speed: f64,
    pub format: AudioFormat,
}

impl From<&TtsConfig> for TtsRequest {
    fn from(config: &TtsConfig) -> Self {
        Self {
            text: config.text.clone(),
            voice: config.voice.clone(),
            language: config.language.clone(),
            speed: config.speed,
            format: config.format,
        }
    }
}

/// Body of `POST /avatar/render`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarRequest {
    pub avatar_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub resolution: Resolution,
    pub fps: u32,
    pub format: OutputFormat,
}

impl From<&AvatarConfig> for AvatarRequest {
    fn from(config: &AvatarConfig) -> Self {
        Self {
            avatar_id: config.avatar_id.clone(),
            text: config.text.clone(),
            audio_url: config.audio_url.clone(),
            voice: config.voice.clone(),
            resolution: config.output.resolution,
            fps: config.output.fps,
            format: config.output.format,
        }
    }
}

/// Media returned by the service.
#[derive(Debug, Clone)]
pub struct SynthesizedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// From the `x-media-duration` response header, when present.
    pub duration_secs: Option<f64>,
}

impl SynthesizedMedia {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tts_request_omits_empty_fields() {
        let config: TtsConfig = serde_json::from_value(serde_json::json!({"text": "Olá"})).unwrap();
        let json = serde_json::to_value(TtsRequest::from(&config)).unwrap();
        assert_eq!(json["text"], "Olá");
        assert_eq!(json["format"], "mp3");
        assert!(json.get("voice").is_none());
    }
}
