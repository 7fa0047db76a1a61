//! Structured job logging.

use tracing::{error, info, info_span, warn, Span};

use render_models::{JobId, JobType};

/// Emits lifecycle events for one attempt of one job. Every event carries
/// `job_id`, `job_type` and `attempt` so attempts can be told apart in
/// aggregated logs.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: JobId,
    job_type: JobType,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job_id: &JobId, job_type: JobType, attempt: u32) -> Self {
        Self {
            job_id: job_id.clone(),
            job_type,
            attempt,
        }
    }

    pub fn started(&self, detail: &str) {
        info!(job_id = %self.job_id, job_type = self.job_type.as_str(), attempt = self.attempt, "Render started: {detail}");
    }

    pub fn progress(&self, detail: &str) {
        info!(job_id = %self.job_id, job_type = self.job_type.as_str(), "{detail}");
    }

    pub fn warning(&self, detail: &str) {
        warn!(job_id = %self.job_id, job_type = self.job_type.as_str(), attempt = self.attempt, "{detail}");
    }

    pub fn failed(&self, detail: &str) {
        error!(job_id = %self.job_id, job_type = self.job_type.as_str(), attempt = self.attempt, "Render failed: {detail}");
    }

    pub fn completed(&self, detail: &str) {
        info!(job_id = %self.job_id, job_type = self.job_type.as_str(), attempt = self.attempt, "Render completed: {detail}");
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Span wrapping all work done for this attempt.
    pub fn span(&self) -> Span {
        info_span!(
            "render_job",
            job_id = %self.job_id,
            job_type = self.job_type.as_str(),
            attempt = self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_keeps_job_identity() {
        let job_id = JobId::new();
        let logger = JobLogger::new(&job_id, JobType::Avatar, 2);

        assert_eq!(logger.job_id(), &job_id);
        assert_eq!(logger.clone().job_id(), &job_id);
    }
}
