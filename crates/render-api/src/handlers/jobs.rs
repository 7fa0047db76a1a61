//! Job submission, control and status handlers.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::info;

use render_models::{
    JobId, JobSnapshot, JobSubmission, JobType, PerformanceMetrics, QueueStats,
};
use render_queue::{CancelOutcome, QueueError};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub job_id: JobId,
    /// cancelled, signalled, already_finished, paused or resumed
    pub outcome: &'static str,
}

/// `POST /api/jobs`
pub async fn submit_job(
    State(state): State<AppState>,
    Json(submission): Json<JobSubmission>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let job_type = submission.job_type;
    match state.queue.submit(submission).await {
        Ok(job_id) => {
            if let Some(job_type) = job_type {
                metrics::record_job_submitted(job_type.as_str());
            }
            Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
        }
        Err(e @ QueueError::Validation(_)) => {
            metrics::record_job_rejected();
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// `GET /api/jobs/:id`
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let job_id = JobId::from_string(job_id);
    state
        .monitor()
        .get_job_progress(&job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))
}

/// `POST /api/jobs/:id/cancel`
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let job_id = JobId::from_string(job_id);
    let outcome = match state.queue.cancel(&job_id).await? {
        CancelOutcome::Cancelled => "cancelled",
        CancelOutcome::Signalled => "signalled",
        CancelOutcome::AlreadyFinished => "already_finished",
    };
    metrics::record_control_command("cancel");
    info!(job_id = %job_id, outcome, "Cancel requested");
    Ok(Json(ControlResponse { job_id, outcome }))
}

/// `POST /api/jobs/:id/pause`
pub async fn pause_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let job_id = JobId::from_string(job_id);
    if !state.queue.pause(&job_id).await? {
        return Err(ApiError::conflict(format!("job {job_id} is not active")));
    }
    metrics::record_control_command("pause");
    Ok(Json(ControlResponse {
        job_id,
        outcome: "paused",
    }))
}

/// `POST /api/jobs/:id/resume`
pub async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let job_id = JobId::from_string(job_id);
    if !state.queue.resume(&job_id).await? {
        return Err(ApiError::conflict(format!("job {job_id} is not paused")));
    }
    metrics::record_control_command("resume");
    Ok(Json(ControlResponse {
        job_id,
        outcome: "resumed",
    }))
}

/// `GET /api/jobs/active`
pub async fn list_active_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<JobSnapshot>>> {
    Ok(Json(state.monitor().list_active_jobs().await?))
}

/// `GET /api/queues/stats`
pub async fn queue_stats(
    State(state): State<AppState>,
) -> ApiResult<Json<BTreeMap<&'static str, QueueStats>>> {
    let mut all = BTreeMap::new();
    for job_type in [JobType::Video, JobType::Tts, JobType::Avatar] {
        let stats = state.queue.stats(job_type).await?;
        metrics::set_queue_waiting(job_type.as_str(), stats.waiting);
        all.insert(job_type.as_str(), stats);
    }
    Ok(Json(all))
}

/// `GET /api/metrics/performance`
pub async fn performance_metrics(
    State(state): State<AppState>,
) -> ApiResult<Json<PerformanceMetrics>> {
    Ok(Json(state.monitor().get_performance_metrics().await?))
}
