//! Prometheus metrics for the API server.

use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use regex_lite::Regex;

/// Install the Prometheus recorder. The handle renders `/metrics`.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "render_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "render_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "render_http_requests_in_flight";

    pub const JOBS_SUBMITTED_TOTAL: &str = "render_jobs_submitted_total";
    pub const JOBS_REJECTED_TOTAL: &str = "render_jobs_rejected_total";
    pub const CONTROL_COMMANDS_TOTAL: &str = "render_control_commands_total";
    pub const QUEUE_WAITING: &str = "render_queue_waiting";

    pub const RATE_LIMIT_HITS_TOTAL: &str = "render_rate_limit_hits_total";
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];
    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_job_submitted(job_type: &str) {
    let labels = [("type", job_type.to_string())];
    counter!(names::JOBS_SUBMITTED_TOTAL, &labels).increment(1);
}

pub fn record_job_rejected() {
    counter!(names::JOBS_REJECTED_TOTAL).increment(1);
}

pub fn record_control_command(action: &str) {
    let labels = [("action", action.to_string())];
    counter!(names::CONTROL_COMMANDS_TOTAL, &labels).increment(1);
}

pub fn set_queue_waiting(job_type: &str, waiting: u64) {
    let labels = [("type", job_type.to_string())];
    gauge!(names::QUEUE_WAITING, &labels).set(waiting as f64);
}

pub fn record_rate_limit_hit(path: &str) {
    let labels = [("path", sanitize_path(path))];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

fn job_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").ok())
        .as_ref()
}

/// Collapse job ids so label cardinality stays bounded.
fn sanitize_path(path: &str) -> String {
    match job_id_pattern() {
        Some(pattern) => pattern.replace_all(path, ":id").into_owned(),
        None => path.to_string(),
    }
}

pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed().as_secs_f64());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(
            sanitize_path("/api/jobs/550e8400-e29b-41d4-a716-446655440000/cancel"),
            "/api/jobs/:id/cancel"
        );
        assert_eq!(sanitize_path("/api/queues/stats"), "/api/queues/stats");
    }
}
