//! REST API server module
//!
//! Provides the FHIR Bulk Data HTTP surface: async import/export kick-offs,
//! job status polling and cancellation, and the streaming download
//! endpoint, with OpenAPI documentation.

use crate::{BulkDataServer, Config, Result};
use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{delete, get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod error_response;
pub mod openapi;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the API router with all route definitions
///
/// # Routes
///
/// ## Kick-offs
/// - `POST /fhir/$import` - Kick off a bulk import job
/// - `GET /fhir/$export` - Kick off a bulk export job
///
/// ## Job Lifecycle
/// - `GET /fhir/job/:id` - Poll job status (202 while running, 200 + manifest when done)
/// - `DELETE /fhir/job/:id` - Cancel a job
///
/// ## Streaming Download
/// - `GET /download/:resource_type` - Stream resources as NDJSON or CSV
///
/// ## System
/// - `GET /health` - Health check
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /swagger-ui` - Interactive Swagger UI documentation (if enabled)
pub fn create_router(server: Arc<BulkDataServer>, config: Arc<Config>) -> Router {
    let state = AppState::new(server, config.clone());

    let router = Router::new()
        // Kick-offs
        .route("/fhir/$import", post(routes::import_kick_off))
        .route("/fhir/$export", get(routes::export_kick_off))
        // Job lifecycle
        .route("/fhir/job/:id", get(routes::job_status))
        .route("/fhir/job/:id", delete(routes::job_cancel))
        // Streaming download
        .route("/download/:resource_type", get(routes::download_resources))
        // System
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec));

    // Merge Swagger UI routes if enabled in config (before applying state)
    // Note: SwaggerUi will use the existing /openapi.json endpoint we already defined
    let router = if config.api.swagger_ui {
        router.merge(SwaggerUi::new("/swagger-ui").url("/openapi.json", ApiDoc::openapi()))
    } else {
        router
    };

    // Add state to all routes
    let router = router.with_state(state);

    // Apply rate limiting middleware if enabled in config (outermost — runs first)
    let router = if config.api.rate_limit.enabled {
        let limiter = Arc::new(rate_limit::RateLimiter::new(config.api.rate_limit.clone()));
        router.layer(middleware::from_fn_with_state(
            limiter,
            rate_limit::rate_limit_middleware,
        ))
    } else {
        router
    };

    // Apply CORS middleware if enabled in config
    if config.api.cors_enabled {
        let cors = build_cors_layer(&config.api.cors_origins);
        router.layer(cors)
    } else {
        router
    }
}

/// Build a CORS layer based on configured origins
///
/// Allows the specified origins (or any, for "*" or an empty list), all
/// methods, and all headers for cross-origin requests.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the API server on the configured bind address.
///
/// Creates a TCP listener, binds it to the configured address, and serves
/// the API router until the server is shut down.
///
/// # Example
///
/// ```no_run
/// use bulk_data_server::{BulkDataServer, Config};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Arc::new(Config::default());
/// let server = Arc::new(BulkDataServer::new((*config).clone()).await?);
///
/// // Start API server (blocks until shutdown)
/// bulk_data_server::api::start_api_server(server, config).await?;
/// # Ok(())
/// # }
/// ```
pub async fn start_api_server(server: Arc<BulkDataServer>, config: Arc<Config>) -> Result<()> {
    let bind_address = config.api.bind_address;

    tracing::info!(
        address = %bind_address,
        "Starting API server"
    );

    let app = create_router(server, config);

    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;

    tracing::info!(
        address = %bind_address,
        "API server listening"
    );

    // Must use into_make_service_with_connect_info to provide
    // ConnectInfo<SocketAddr> for the rate limiting middleware
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
