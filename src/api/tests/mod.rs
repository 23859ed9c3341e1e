use super::*;
use crate::server::test_helpers::create_test_server;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;


/// Helper to create a router over a test server instance
async fn create_test_app() -> (Router, Arc<BulkDataServer>, TempDir) {
    create_test_app_with(|_| {}).await
}

/// Helper to create a router with the test configuration tweaked first
async fn create_test_app_with(tweak: impl FnOnce(&mut Config)) -> (Router, Arc<BulkDataServer>, TempDir)
{
    let (mut server, temp_dir) = create_test_server().await;
    let mut config = (*server.get_config()).clone();
    tweak(&mut config);
    let config = Arc::new(config);

    server.config = Arc::clone(&config);
    let server = Arc::new(server);
    let app = create_router(Arc::clone(&server), config);
    (app, server, temp_dir)
}

/// Read a response body as JSON
async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Read a response body as text
async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_api_server_spawns() {
    let (mut server, _temp_dir) = create_test_server().await;

    let mut config = (*server.get_config()).clone();
    config.api.bind_address = "127.0.0.1:0".parse().unwrap(); // OS assigns a free port
    server.config = Arc::new(config);
    let server = Arc::new(server);

    let api_handle = server.spawn_api_server();

    // Give it a moment to start, then shut it down
    tokio::time::sleep(Duration::from_millis(100)).await;
    api_handle.abort();
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _server, _temp_dir) = create_test_app().await;

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_jobs"], 0);
}

#[tokio::test]
async fn test_openapi_endpoint() {
    let (app, _server, _temp_dir) = create_test_app().await;

    let request = Request::builder()
        .uri("/openapi.json")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["paths"].get("/fhir/$import").is_some());
}

#[tokio::test]
async fn test_cors_enabled() {
    let (app, _server, _temp_dir) = create_test_app_with(|config| {
        config.api.cors_enabled = true;
        config.api.cors_origins = vec!["*".to_string()];
    })
    .await;

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin"),
        "CORS header should be present when CORS is enabled"
    );
}

#[tokio::test]
async fn test_rate_limit_middleware_rejects_over_budget() {
    let (app, _server, _temp_dir) = create_test_app_with(|config| {
        config.api.rate_limit.enabled = true;
        config.api.rate_limit.max_requests = 2;
        config.api.rate_limit.window_secs = 60;
    })
    .await;

    let addr: std::net::SocketAddr = "127.0.0.1:4321".parse().unwrap();
    let send = |app: Router| async move {
        let mut request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        app.oneshot(request).await.unwrap()
    };

    assert_eq!(send(app.clone()).await.status(), StatusCode::OK);
    assert_eq!(send(app.clone()).await.status(), StatusCode::OK);

    let response = send(app.clone()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let body = body_json(response).await;
    assert_eq!(body["resourceType"], "OperationOutcome");
    assert_eq!(body["issue"][0]["code"], "throttled");
}
