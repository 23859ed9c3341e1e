//! OpenAPI documentation and schema generation
//!
//! This module defines the OpenAPI specification for the bulk data REST API
//! using utoipa for compile-time spec generation.

use utoipa::OpenApi;

/// OpenAPI documentation for the bulk data REST API
///
/// The spec can be accessed via:
/// - `/openapi.json` - JSON format OpenAPI specification
/// - `/swagger-ui` - Interactive Swagger UI documentation (if enabled)
#[derive(OpenApi)]
#[openapi(
    info(
        title = "bulk-data-server REST API",
        version = "0.2.0",
        description = "Reference FHIR Bulk Data export/import server for client testing",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    paths(
        // Kick-offs
        crate::api::routes::import_kick_off,
        crate::api::routes::export_kick_off,

        // Job lifecycle
        crate::api::routes::job_status,
        crate::api::routes::job_cancel,

        // Streaming download
        crate::api::routes::download_resources,

        // System
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
    ),
    components(schemas(
        crate::types::JobId,
        crate::types::JobKind,
        crate::types::ImportInput,
        crate::types::ImportRequest,
        crate::types::ManifestEntry,
        crate::types::JobManifest,
        crate::types::Event,
        crate::task::TaskSnapshot,
        crate::error::OperationOutcome,
        crate::error::OutcomeIssue,
    )),
    tags(
        (name = "import", description = "Bulk import kick-off"),
        (name = "export", description = "Bulk export kick-off"),
        (name = "jobs", description = "Job status polling and cancellation"),
        (name = "download", description = "Streaming resource download"),
        (name = "system", description = "Health and documentation")
    )
)]
pub struct ApiDoc;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_spec_contains_every_route() {
        let spec = ApiDoc::openapi();
        let paths = spec.paths.paths;

        assert!(paths.contains_key("/fhir/$import"));
        assert!(paths.contains_key("/fhir/$export"));
        assert!(paths.contains_key("/fhir/job/{id}"));
        assert!(paths.contains_key("/download/{resource_type}"));
        assert!(paths.contains_key("/health"));
        assert!(paths.contains_key("/openapi.json"));
    }
}
