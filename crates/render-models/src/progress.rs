//! Progress events, control commands and queue aggregates.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, JobStatus, JobType};

/// Channel used to deliver pause/resume/cancel requests to workers.
pub const CONTROL_CHANNEL: &str = "render:control";

/// Payload published on a type's progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

impl From<&Job> for ProgressEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            status: job.status,
            progress: job.progress,
            error: job.error.clone(),
            started_at: job.started_at,
            finished_at: job.finished_at,
            processing_time_ms: job.processing_time_ms,
        }
    }
}

/// Requested action on a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlCommand {
    pub job_id: JobId,
    pub action: ControlAction,
}

/// Per-type queue counts, derived on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Aggregate computed from persisted job records.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_jobs: u64,
    pub completed: u64,
    pub failed: u64,
    pub average_processing_time_ms: f64,
}

impl PerformanceMetrics {
    /// Fold job records into metrics. Average covers completed jobs only.
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut metrics = Self::default();
        let mut total_ms: u64 = 0;

        for job in jobs {
            metrics.total_jobs += 1;
            match job.status {
                JobStatus::Completed => {
                    metrics.completed += 1;
                    total_ms += job.processing_time_ms.unwrap_or(0);
                }
                JobStatus::Failed => metrics.failed += 1,
                _ => {}
            }
        }

        if metrics.completed > 0 {
            metrics.average_processing_time_ms = total_ms as f64 / metrics.completed as f64;
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobConfig, TtsConfig, AudioFormat};
    use crate::job::Priority;

    fn job(status: JobStatus, ms: Option<u64>) -> Job {
        let config = JobConfig::Tts(TtsConfig {
            text: "hi".to_string(),
            voice: None,
            language: None,
            speed: 1.0,
            format: AudioFormat::Mp3,
        });
        let mut job = Job::new(JobType::Tts, Priority::Normal, config, None, 0, 3);
        job.status = status;
        job.processing_time_ms = ms;
        job
    }

    #[test]
    fn test_performance_metrics_average_completed_only() {
        let jobs = vec![
            job(JobStatus::Completed, Some(1000)),
            job(JobStatus::Completed, Some(3000)),
            job(JobStatus::Failed, Some(500)),
            job(JobStatus::Queued, None),
        ];
        let m = PerformanceMetrics::from_jobs(&jobs);
        assert_eq!(m.total_jobs, 4);
        assert_eq!(m.completed, 2);
        assert_eq!(m.failed, 1);
        assert!((m.average_processing_time_ms - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_event_payload_shape() {
        let j = job(JobStatus::Active, None);
        let value = serde_json::to_value(ProgressEvent::from(&j)).unwrap();
        assert_eq!(value["status"], "active");
        assert_eq!(value["type"], "tts");
        assert!(value.get("jobId").is_some());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_control_command_json() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"jobId":"abc","action":"cancel"}"#).unwrap();
        assert_eq!(cmd.action, ControlAction::Cancel);
        assert_eq!(cmd.job_id.as_str(), "abc");
    }
}
