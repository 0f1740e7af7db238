use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use std::sync::Arc;
use webextract::{build_app, config::Config, engine::Engine, jobs::JobManager, AppState};

/// State with lazy backends and no browser: enough to exercise the HTTP
/// surface that does not need live Postgres/Redis.
fn test_state() -> AppState {
    let config = Arc::new(Config::for_tests());
    let engine = Arc::new(Engine::for_tests(config).expect("lazy engine"));
    let jobs = Arc::new(JobManager::new(engine.clone()));
    AppState { engine, jobs }
}

#[tokio::test]
async fn test_health_reports_dependencies() {
    let server = TestServer::new(build_app(test_state())).unwrap();

    let response = server.get("/health").await;
    response.assert_status(StatusCode::OK);

    let body = response.json::<Value>();
    // No live backends in this test rig: the probe degrades, never errors.
    let status = body["status"].as_str().unwrap();
    assert!(["ok", "degraded"].contains(&status));
    assert!(body["dependencies"]["database"].is_boolean());
    assert!(body["dependencies"]["redis"].is_boolean());
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_metrics_exposition() {
    let server = TestServer::new(build_app(test_state())).unwrap();

    let response = server.get("/metrics").await;
    response.assert_status(StatusCode::OK);

    let text = response.text();
    assert!(text.contains("ssrf_blocked_total"));
    assert!(text.contains("cache_hits_total"));
    assert!(text.contains("fetch_duration_ms_p50"));
}

#[tokio::test]
async fn test_missing_api_key_is_unauthorized() {
    let server = TestServer::new(build_app(test_state())).unwrap();

    let response = server
        .post("/api/v1/scrape")
        .json(&json!({ "url": "https://example.com" }))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    let body = response.json::<Value>();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    assert!(body["error"]["request_id"].is_string());
}

#[tokio::test]
async fn test_map_requires_api_key() {
    let server = TestServer::new(build_app(test_state())).unwrap();

    let response = server
        .post("/api/v1/map")
        .json(&json!({ "url": "https://example.com", "max_depth": 1, "max_pages": 5 }))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_request_id_header_present() {
    let server = TestServer::new(build_app(test_state())).unwrap();

    let response = server.get("/health").await;
    response.assert_status(StatusCode::OK);
    assert!(response.headers().get("X-Request-Id").is_some());
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let server = TestServer::new(build_app(test_state())).unwrap();

    let response = server.get("/api/v1/unknown").await;
    response.assert_status(StatusCode::NOT_FOUND);
}
