use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use webextract::{build_app, config::Config, engine::Engine, jobs::JobManager, AppState};

#[tokio::main]
async fn main() {
    // Initialize tracing with RUST_LOG env filter (defaults to "info")
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration from environment variables
    let config =
        Arc::new(Config::from_env().expect("Failed to load configuration from environment"));
    let port = config.port;

    let engine = Arc::new(
        Engine::init(config)
            .await
            .expect("Failed to initialize engine"),
    );
    let jobs = Arc::new(JobManager::new(engine.clone()));

    let state = AppState {
        engine: engine.clone(),
        jobs: jobs.clone(),
    };

    let app = build_app(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("webextract service starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("Server error");

    jobs.stop();
    engine.shutdown().await;
}
