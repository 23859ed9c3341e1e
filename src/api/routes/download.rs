//! Streaming download handler.

use crate::api::AppState;
use crate::error::Error;
use crate::paging::{ExportOptions, OutputFormat, row_stream};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;

/// Query parameters of a streaming download
#[derive(Debug, Deserialize, IntoParams)]
pub struct DownloadQuery {
    /// Maximum rows in this response (default from configuration)
    pub limit: Option<u64>,
    /// Rows to skip into the virtual dataset (default 0)
    pub offset: Option<u64>,
    /// Virtual copies of the real dataset (default from configuration)
    pub m: Option<u64>,
    /// Set to 1 to annotate rows with their modification timestamp
    pub extended: Option<u8>,
    /// Restrict rows to one patient group
    pub group: Option<String>,
    /// Output format: `application/fhir+ndjson` (default) or `text/csv`
    #[serde(rename = "_outputFormat")]
    pub output_format: Option<String>,
}

/// GET /download/:resource_type - Stream resources as NDJSON (or CSV)
///
/// Streams rows of one resource type, honoring the virtual-pagination
/// parameters: `offset` pages into the `m`-times-replayed dataset, and
/// rows on fabricated pages get deterministic id prefixes.
#[utoipa::path(
    get,
    path = "/download/{resource_type}",
    tag = "download",
    params(
        ("resource_type" = String, Path, description = "FHIR resource type to stream"),
        DownloadQuery
    ),
    responses(
        (status = 200, description = "NDJSON or CSV row stream"),
        (status = 400, description = "Invalid parameters"),
        (status = 415, description = "Unsupported output format")
    )
)]
pub async fn download_resources(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let export = &state.config.export;

    let limit = query.limit.unwrap_or(export.default_page_limit);
    if limit == 0 || limit > export.max_page_limit {
        return Error::InvalidRequest(format!(
            "limit must be between 1 and {}",
            export.max_page_limit
        ))
        .into_response();
    }

    let format = match query.output_format.as_deref() {
        None | Some("application/fhir+ndjson") | Some("ndjson") => OutputFormat::Ndjson,
        Some("text/csv") | Some("csv") => OutputFormat::Csv,
        Some(other) => return Error::UnsupportedFormat(other.to_string()).into_response(),
    };

    let options = ExportOptions {
        resource_type,
        group_id: query.group,
        limit,
        offset: query.offset.unwrap_or(0),
        multiplier: query.m.unwrap_or(export.default_multiplier).max(1),
        extended: query.extended.unwrap_or(0) != 0,
        format,
        row_delay: state.config.row_delay(),
    };

    let content_type = match format {
        OutputFormat::Ndjson => "application/fhir+ndjson",
        OutputFormat::Csv => "text/csv",
    };
    let stream = row_stream(Arc::clone(&state.server.db), options);

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(e) => Error::ApiServerError(e.to_string()).into_response(),
    }
}
