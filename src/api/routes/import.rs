//! Bulk import kick-off handler.

use crate::api::AppState;
use crate::api::routes::require_kickoff_headers;
use crate::error::{Error, OperationOutcome};
use crate::types::ImportRequest;
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};

/// POST /fhir/$import - Kick off a bulk import job
///
/// Accepts a ping-and-pull import request and answers 202 with the job's
/// polling URL in `Content-Location`. The body must be JSON and the
/// request must carry the async kick-off headers.
#[utoipa::path(
    post,
    path = "/fhir/$import",
    tag = "import",
    request_body = ImportRequest,
    responses(
        (status = 202, description = "Import job accepted; poll the Content-Location URL", body = OperationOutcome),
        (status = 400, description = "Malformed request body or headers", body = OperationOutcome),
        (status = 415, description = "Unsupported input format", body = OperationOutcome),
        (status = 429, description = "Another bulk job is already running", body = OperationOutcome)
    )
)]
pub async fn import_kick_off(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Err(e) = require_kickoff_headers(&headers) {
        return e.into_response();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json")
        && !content_type.starts_with("application/fhir+json")
    {
        return Error::InvalidRequest(format!(
            "the Content-Type header must be application/json, got \"{content_type}\""
        ))
        .into_response();
    }

    let request: ImportRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return Error::InvalidRequest(format!("malformed kick-off body: {e}")).into_response();
        }
    };

    let base = state.config.api.base_url.trim_end_matches('/').to_string();
    match state
        .server
        .kick_off_import(format!("{base}/fhir/$import"), request)
        .await
    {
        Ok(id) => (
            StatusCode::ACCEPTED,
            [(header::CONTENT_LOCATION, format!("{base}/fhir/job/{id}"))],
            Json(OperationOutcome::information(
                "bulk import job accepted; poll the Content-Location URL for status",
            )),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
