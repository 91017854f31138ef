use axum::extract::{Path, State};
use axum::Json;
use flowwatch_core::metrics::AggregateMetrics;
use flowwatch_core::sink::DeadLetter;
use flowwatch_core::MonitorHealth;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/metrics: latest aggregate snapshot.
pub async fn get_metrics(State(app): State<AppState>) -> Json<AggregateMetrics> {
    Json((*app.monitor.get_metrics_snapshot()).clone())
}

/// GET /api/agents/{name}/utilization
pub async fn get_agent_utilization(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    let utilization = app.monitor.get_agent_utilization(&name);
    Json(serde_json::json!({ "agent_name": name, "utilization": utilization }))
}

/// GET /api/health: sink and registry health. `degraded` means persistence
/// has dead-lettered changes; it says nothing about workflow outcomes.
pub async fn get_health(State(app): State<AppState>) -> Json<MonitorHealth> {
    Json(app.monitor.health())
}

/// POST /api/flush: persist everything queued so far.
pub async fn flush(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    app.monitor.flush().await?;
    Ok(Json(serde_json::json!({ "flushed": true })))
}

/// GET /api/dead-letters: changes that exhausted their persistence attempts.
pub async fn list_dead_letters(State(app): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(app.monitor.dead_letters())
}

/// POST /api/dead-letters/requeue: retry every dead-lettered change.
pub async fn requeue_dead_letters(State(app): State<AppState>) -> Json<serde_json::Value> {
    let requeued = app.monitor.requeue_dead_letters();
    Json(serde_json::json!({ "requeued": requeued }))
}
