//! Job definitions for queue processing.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{AvatarConfig, JobConfig, TtsConfig, VideoConfig};

/// Default number of attempts before a job is failed permanently.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Jobs estimated under this many seconds get a priority boost.
pub const SHORT_JOB_SECS: f64 = 30.0;
/// Score added to short jobs.
pub const SHORT_JOB_BOOST: u32 = 2;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of job. Each type has its own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Video,
    Tts,
    Avatar,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::Video, JobType::Tts, JobType::Avatar];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Video => "video",
            JobType::Tts => "tts",
            JobType::Avatar => "avatar",
        }
    }

    /// Pub/sub channel progress events for this type are published on.
    pub fn progress_channel(&self) -> &'static str {
        match self {
            JobType::Video => "render:progress",
            JobType::Tts => "tts:progress",
            JobType::Avatar => "avatar:progress",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Numeric score; higher is served first.
    pub fn score(&self) -> u32 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 10,
            Priority::Urgent => 20,
        }
    }

    /// Score including the short-job boost.
    pub fn score_for(&self, estimated_render_secs: f64) -> u32 {
        if estimated_render_secs < SHORT_JOB_SECS {
            self.score() + SHORT_JOB_BOOST
        } else {
            self.score()
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional descriptive metadata supplied by the submitter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct JobMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Artifact produced by a successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub artifact_url: String,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    pub size_bytes: u64,
    /// Served from the rendering cache.
    #[serde(default)]
    pub cached: bool,
}

/// Rejected submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A job as submitted by the web layer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobSubmission {
    #[serde(rename = "type")]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<JobMetadata>,
}

impl JobSubmission {
    pub fn new(job_type: JobType, priority: Priority, config: serde_json::Value) -> Self {
        Self {
            job_type: Some(job_type),
            priority,
            config: Some(config),
            metadata: None,
        }
    }

    /// Check required fields and decode the type-specific config.
    pub fn validate(&self) -> Result<(JobType, JobConfig), ValidationError> {
        let job_type = self
            .job_type
            .ok_or_else(|| ValidationError::new("type", "is required"))?;

        let raw = match &self.config {
            Some(serde_json::Value::Object(map)) if !map.is_empty() => {
                serde_json::Value::Object(map.clone())
            }
            Some(serde_json::Value::Object(_)) | None | Some(serde_json::Value::Null) => {
                return Err(ValidationError::new("config", "is required"))
            }
            Some(_) => return Err(ValidationError::new("config", "must be an object")),
        };

        let config = match job_type {
            JobType::Video => {
                let c: VideoConfig = decode(raw)?;
                if c.source.trim().is_empty() {
                    return Err(ValidationError::new("config.source", "must not be empty"));
                }
                if c.settings.output.fps == 0 {
                    return Err(ValidationError::new("config.output.fps", "must be positive"));
                }
                JobConfig::Video(c)
            }
            JobType::Tts => {
                let c: TtsConfig = decode(raw)?;
                if c.text.trim().is_empty() {
                    return Err(ValidationError::new("config.text", "must not be empty"));
                }
                if c.speed <= 0.0 {
                    return Err(ValidationError::new("config.speed", "must be positive"));
                }
                JobConfig::Tts(c)
            }
            JobType::Avatar => {
                let c: AvatarConfig = decode(raw)?;
                if c.avatar_id.trim().is_empty() {
                    return Err(ValidationError::new("config.avatarId", "must not be empty"));
                }
                let has_text = c.text.as_deref().is_some_and(|t| !t.trim().is_empty());
                if !has_text && c.audio_url.is_none() {
                    return Err(ValidationError::new(
                        "config",
                        "avatar jobs need text or audioUrl",
                    ));
                }
                JobConfig::Avatar(c)
            }
        };

        Ok((job_type, config))
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw: serde_json::Value) -> Result<T, ValidationError> {
    serde_json::from_value(raw).map_err(|e| ValidationError::new("config", e.to_string()))
}

/// Durable job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub priority: Priority,
    pub priority_score: u32,
    /// Submission order, used for FIFO within a priority tier.
    pub sequence: u64,
    pub config: JobConfig,
    #[serde(default)]
    pub metadata: Option<JobMetadata>,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Identifies the worker attempt that currently owns the job.
    #[serde(default)]
    pub worker_token: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failed_stage: Option<String>,
}

impl Job {
    /// Build a queued job from a validated submission.
    pub fn new(
        job_type: JobType,
        priority: Priority,
        config: JobConfig,
        metadata: Option<JobMetadata>,
        sequence: u64,
        max_attempts: u32,
    ) -> Self {
        let priority_score = priority.score_for(config.estimated_render_secs());
        Self {
            id: JobId::new(),
            job_type,
            priority,
            priority_score,
            sequence,
            config,
            metadata,
            status: JobStatus::Queued,
            progress: 0,
            attempts: 0,
            max_attempts,
            worker_token: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            processing_time_ms: None,
            result: None,
            error: None,
            failed_stage: None,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from(self)
    }
}

/// Read-only view of a job exposed to status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub priority: Priority,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type,
            priority: job.priority,
            status: job.status,
            progress: job.progress,
            attempts: job.attempts,
            error: job.error.clone(),
            failed_stage: job.failed_stage.clone(),
            result: job.result.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            processing_time_ms: job.processing_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_scores() {
        assert!(Priority::Urgent.score() > Priority::High.score());
        assert!(Priority::High.score() > Priority::Normal.score());
        assert!(Priority::Normal.score() > Priority::Low.score());
        assert_eq!(Priority::Normal.score_for(10.0), 7);
        assert_eq!(Priority::Normal.score_for(45.0), 5);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }

    #[test]
    fn test_validate_video_submission() {
        let sub = JobSubmission::new(
            JobType::Video,
            Priority::High,
            json!({"source": "/tmp/in.mp4", "output": {"resolution": "720p"}}),
        );
        let (job_type, config) = sub.validate().unwrap();
        assert_eq!(job_type, JobType::Video);
        assert!(matches!(config, JobConfig::Video(_)));
    }

    #[test]
    fn test_validate_rejects_missing_type() {
        let sub = JobSubmission {
            job_type: None,
            priority: Priority::Normal,
            config: Some(json!({"text": "hi"})),
            metadata: None,
        };
        assert_eq!(sub.validate().unwrap_err().field, "type");
    }

    #[test]
    fn test_validate_rejects_empty_config() {
        let sub = JobSubmission::new(JobType::Tts, Priority::Normal, json!({}));
        assert_eq!(sub.validate().unwrap_err().field, "config");
    }

    #[test]
    fn test_validate_rejects_video_without_output() {
        let sub = JobSubmission::new(JobType::Video, Priority::Normal, json!({"source": "in.mp4"}));
        let err = sub.validate().unwrap_err();
        assert_eq!(err.field, "config");
        assert!(err.reason.contains("output"));
    }

    #[test]
    fn test_validate_rejects_avatar_without_script() {
        let sub = JobSubmission::new(
            JobType::Avatar,
            Priority::Normal,
            json!({"avatarId": "anna", "output": {}}),
        );
        assert!(sub.validate().is_err());
    }

    #[test]
    fn test_new_job_is_queued_with_boosted_score() {
        let sub = JobSubmission::new(JobType::Tts, Priority::Low, json!({"text": "short line"}));
        let (job_type, config) = sub.validate().unwrap();
        let job = Job::new(job_type, Priority::Low, config, None, 1, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.priority_score, 3);
    }

    #[test]
    fn test_job_record_round_trips_through_json() {
        let sub = JobSubmission::new(JobType::Tts, Priority::Urgent, json!({"text": "hello"}));
        let (job_type, config) = sub.validate().unwrap();
        let job = Job::new(job_type, Priority::Urgent, config, None, 7, 3);
        let encoded = serde_json::to_string(&job).unwrap();
        assert!(encoded.contains("\"type\":\"tts\""));
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
    }
}
