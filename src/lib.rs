pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod search;
pub mod server;
pub mod storage;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::jobs::JobManager;

/// Shared application state passed to all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub jobs: Arc<JobManager>,
}

pub fn build_app(state: AppState) -> Router {
    // CORS layer — permissive for the internal service
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/scrape", post(server::routes::scrape))
        .route("/api/v1/map", post(server::routes::create_map))
        .route("/api/v1/map/{job_id}", get(server::routes::map_status))
        .route("/api/v1/agent/extract", post(server::routes::agent_extract))
        .route("/api/v1/search", post(server::routes::search))
        .route(
            "/api/v1/search/results/{task_id}",
            get(server::routes::search_results),
        )
        .route("/api/v1/jobs/{job_id}", get(server::routes::job_status))
        .route(
            "/api/v1/jobs/{job_id}/results",
            get(server::routes::job_results),
        )
        .route("/health", get(server::routes::health))
        .route("/metrics", get(server::routes::metrics_text))
        .layer(middleware::from_fn(server::request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
