//! Shared data models for the render orchestration backend.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, submissions and status snapshots
//! - Per-type job configuration and pipeline stages
//! - Output encoding settings
//! - Audio enhancements, filters, watermarks and subtitles
//! - Progress events and queue aggregates

pub mod config;
pub mod effects;
pub mod encoding;
pub mod job;
pub mod progress;

// Re-export common types
pub use config::{
    AudioFormat, AvatarConfig, JobConfig, RenderSettings, Scene, StageKind, TtsConfig, VideoConfig,
};
pub use effects::{
    AudioEffect, AudioEnhancement, SubtitleSpec, SubtitleStyle, VideoFilter, WatermarkContent,
    WatermarkPosition, WatermarkSpec,
};
pub use encoding::{EncodingProfile, OutputFormat, OutputSettings, QualityTier, Resolution};
pub use job::{
    Job, JobId, JobMetadata, JobResult, JobSnapshot, JobStatus, JobSubmission, JobType, Priority,
    ValidationError, DEFAULT_MAX_ATTEMPTS,
};
pub use progress::{
    ControlAction, ControlCommand, PerformanceMetrics, ProgressEvent, QueueStats, CONTROL_CHANNEL,
};
