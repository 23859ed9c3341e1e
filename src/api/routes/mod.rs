//! Route handlers for the bulk data API
//!
//! Handlers are organized by domain:
//! - [`import`] — Bulk import kick-off
//! - [`export`] — Bulk export kick-off
//! - [`jobs`] — Job status polling and cancellation
//! - [`download`] — Streaming resource download
//! - [`system`] — Health and OpenAPI

mod download;
mod export;
mod import;
mod jobs;
mod system;

// Re-export all handlers so `routes::function_name` continues to work
pub use download::*;
pub use export::*;
pub use import::*;
pub use jobs::*;
pub use system::*;

use crate::error::{Error, Result};
use axum::http::HeaderMap;
use axum::http::header;

/// Enforce the async kick-off headers.
///
/// Kick-off requests must carry `Prefer: respond-async` and accept
/// `application/fhir+json` responses.
pub(crate) fn require_kickoff_headers(headers: &HeaderMap) -> Result<()> {
    let prefer = headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !prefer.to_ascii_lowercase().contains("respond-async") {
        return Err(Error::InvalidRequest(
            "the Prefer header must include respond-async".to_string(),
        ));
    }

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !accept.contains("application/fhir+json") && !accept.contains("*/*") {
        return Err(Error::InvalidRequest(
            "the Accept header must be application/fhir+json".to_string(),
        ));
    }
    Ok(())
}
