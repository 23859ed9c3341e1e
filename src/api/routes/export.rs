//! Bulk export kick-off handler.

use crate::api::AppState;
use crate::api::routes::require_kickoff_headers;
use crate::error::{Error, OperationOutcome};
use crate::task::export::ExportParams;
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use utoipa::IntoParams;

/// Query parameters of an export kick-off
#[derive(Debug, Deserialize, IntoParams)]
pub struct ExportQuery {
    /// Comma-separated resource types to export (default: every ingested type)
    #[serde(rename = "_type")]
    pub types: Option<String>,
    /// Restrict rows to one patient group
    pub group: Option<String>,
    /// Row limit baked into the generated download links
    pub limit: Option<u64>,
    /// Dataset multiplier baked into the generated download links
    pub m: Option<u64>,
}

/// GET /fhir/$export - Kick off a bulk export job
///
/// Registers a simulated export and answers 202 with the job's polling URL
/// in `Content-Location`. Once the job completes, the status poll returns
/// a manifest of download links.
#[utoipa::path(
    get,
    path = "/fhir/$export",
    tag = "export",
    params(ExportQuery),
    responses(
        (status = 202, description = "Export job accepted; poll the Content-Location URL", body = OperationOutcome),
        (status = 400, description = "Invalid parameters", body = OperationOutcome),
        (status = 429, description = "Another bulk job is already running", body = OperationOutcome)
    )
)]
pub async fn export_kick_off(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ExportQuery>,
) -> Response {
    if let Err(e) = require_kickoff_headers(&headers) {
        return e.into_response();
    }

    let export = &state.config.export;
    let page_limit = query.limit.unwrap_or(export.default_page_limit);
    if page_limit == 0 || page_limit > export.max_page_limit {
        return Error::InvalidRequest(format!(
            "limit must be between 1 and {}",
            export.max_page_limit
        ))
        .into_response();
    }

    let resource_types = query
        .types
        .map(|types| {
            types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let params = ExportParams {
        resource_types,
        group_id: query.group,
        page_limit,
        multiplier: query.m.unwrap_or(export.default_multiplier).max(1),
    };

    let base = state.config.api.base_url.trim_end_matches('/').to_string();
    match state
        .server
        .kick_off_export(format!("{base}/fhir/$export"), params)
        .await
    {
        Ok(id) => (
            StatusCode::ACCEPTED,
            [(header::CONTENT_LOCATION, format!("{base}/fhir/job/{id}"))],
            Json(OperationOutcome::information(
                "bulk export job accepted; poll the Content-Location URL for status",
            )),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
