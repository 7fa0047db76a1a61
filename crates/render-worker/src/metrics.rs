//! Prometheus metrics for render workers.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::error::{WorkerError, WorkerResult};

/// Metric names.
pub mod names {
    pub const JOBS_COMPLETED_TOTAL: &str = "render_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "render_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "render_jobs_retried_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "render_jobs_cancelled_total";
    pub const JOB_DURATION_SECONDS: &str = "render_job_duration_seconds";

    pub const STAGE_DURATION_SECONDS: &str = "render_stage_duration_seconds";
    pub const STAGE_FAILURES_TOTAL: &str = "render_stage_failures_total";

    pub const CACHE_HITS_TOTAL: &str = "render_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "render_cache_misses_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "render_cache_evictions_total";

    pub const POOL_ACTIVE_JOBS: &str = "render_pool_active_jobs";
    pub const STALLED_JOBS_TOTAL: &str = "render_stalled_jobs_total";
}

/// Install the Prometheus recorder with an HTTP listener on `port`.
pub fn init_metrics(port: u16) -> WorkerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {e}")))
}

pub fn record_job_completed(job_type: &str, duration_secs: f64) {
    let labels = [("type", job_type.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_job_failed(job_type: &str) {
    let labels = [("type", job_type.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_retried(job_type: &str) {
    let labels = [("type", job_type.to_string())];
    counter!(names::JOBS_RETRIED_TOTAL, &labels).increment(1);
}

pub fn record_job_cancelled(job_type: &str) {
    let labels = [("type", job_type.to_string())];
    counter!(names::JOBS_CANCELLED_TOTAL, &labels).increment(1);
}

pub fn record_stage(stage: &str, duration_secs: f64, success: bool) {
    let labels = [("stage", stage.to_string())];
    histogram!(names::STAGE_DURATION_SECONDS, &labels).record(duration_secs);
    if !success {
        counter!(names::STAGE_FAILURES_TOTAL, &labels).increment(1);
    }
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_cache_evictions(count: usize) {
    if count > 0 {
        counter!(names::CACHE_EVICTIONS_TOTAL).increment(count as u64);
    }
}

pub fn set_pool_active(job_type: &str, active: usize) {
    let labels = [("type", job_type.to_string())];
    gauge!(names::POOL_ACTIVE_JOBS, &labels).set(active as f64);
}

pub fn record_stalled_job(job_type: &str) {
    let labels = [("type", job_type.to_string())];
    counter!(names::STALLED_JOBS_TOTAL, &labels).increment(1);
}
