pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use flowwatch_core::Monitor;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(monitor: Arc<Monitor>) -> Router {
    let app_state = state::AppState::new(monitor);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Ingestion
        .route("/api/events", post(routes::events::ingest_event))
        // Notifications (SSE)
        .route("/api/stream", get(routes::stream::sse_stream))
        // Workflows
        .route("/api/workflows", get(routes::workflows::list_workflows))
        .route("/api/workflows/{id}", get(routes::workflows::get_workflow))
        .route(
            "/api/executions/{agent}/{task}",
            get(routes::workflows::get_execution),
        )
        // Metrics
        .route("/api/metrics", get(routes::metrics::get_metrics))
        .route(
            "/api/agents/{name}/utilization",
            get(routes::metrics::get_agent_utilization),
        )
        // Health and persistence
        .route("/api/health", get(routes::metrics::get_health))
        .route("/api/flush", post(routes::metrics::flush))
        .route(
            "/api/dead-letters",
            get(routes::metrics::list_dead_letters),
        )
        .route(
            "/api/dead-letters/requeue",
            post(routes::metrics::requeue_dead_letters),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Serve the API on a pre-bound listener until `shutdown` resolves.
///
/// Accepting a bound `TcpListener` lets the caller read the actual port
/// first (useful when binding port 0).
pub async fn serve_on(
    monitor: Arc<Monitor>,
    listener: tokio::net::TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(monitor);

    tracing::info!("flowwatch listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
