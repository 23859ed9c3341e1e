//! Job status polling and cancellation handlers.

use crate::api::AppState;
use crate::error::{Error, OperationOutcome};
use crate::types::JobId;
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
};

/// GET /fhir/job/:id - Poll a bulk job's status
///
/// While the job runs, answers 202 with `Retry-After` and `X-Progress`
/// headers and a short progress message. Once the job has ended, answers
/// 200 with the completion manifest.
#[utoipa::path(
    get,
    path = "/fhir/job/{id}",
    tag = "jobs",
    params(
        ("id" = String, Path, description = "Job ID from the kick-off Content-Location")
    ),
    responses(
        (status = 200, description = "Job complete; body is the manifest"),
        (status = 202, description = "Job still in progress"),
        (status = 404, description = "Unknown job id", body = OperationOutcome)
    )
)]
pub async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job_id = JobId::from(id.as_str());
    let Some(task) = state.server.task_manager().get(&job_id) else {
        return Error::NotFound(format!("job {job_id}")).into_response();
    };

    let snapshot = task.snapshot();
    if !snapshot.is_ended() {
        let percent = format!("{:.0}%", snapshot.percent());
        return (
            StatusCode::ACCEPTED,
            [
                (
                    header::RETRY_AFTER,
                    state.config.import.retry_after_secs.to_string(),
                ),
                (HeaderName::from_static("x-progress"), percent.clone()),
            ],
            format!("bulk job in progress, {percent} complete"),
        )
            .into_response();
    }

    match task.manifest() {
        Some(manifest) => (StatusCode::OK, Json(manifest)).into_response(),
        // tasks without a manifest report their final snapshot
        None => (StatusCode::OK, Json(snapshot)).into_response(),
    }
}

/// DELETE /fhir/job/:id - Cancel a bulk job
///
/// Detaches the job from the registry and aborts its in-flight work.
/// An unknown id (never existed, already completed and evicted) is a 404;
/// the registry keeps no history beyond the eviction grace period.
#[utoipa::path(
    delete,
    path = "/fhir/job/{id}",
    tag = "jobs",
    params(
        ("id" = String, Path, description = "Job ID from the kick-off Content-Location")
    ),
    responses(
        (status = 202, description = "Job cancelled", body = OperationOutcome),
        (status = 404, description = "Unknown job id", body = OperationOutcome)
    )
)]
pub async fn job_cancel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job_id = JobId::from(id.as_str());
    if state.server.cancel_job(&job_id) {
        (
            StatusCode::ACCEPTED,
            Json(OperationOutcome::information("bulk job cancelled")),
        )
            .into_response()
    } else {
        Error::NotFound(format!("job {job_id}")).into_response()
    }
}
