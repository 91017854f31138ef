use axum::extract::{Path, Query, State};
use axum::Json;
use flowwatch_core::workflow::{AgentExecution, WorkflowExecution};
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    /// `finished` lists retained workflows (newest first) instead of live ones.
    pub status: Option<String>,
}

/// GET /api/workflows: active and paused workflows ordered by creation time
/// (`?status=finished` for the retained ones).
pub async fn list_workflows(
    State(app): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Json<Vec<WorkflowExecution>> {
    let list = match q.status.as_deref() {
        Some("finished") => app.monitor.list_retained_workflows(),
        _ => app.monitor.list_active_workflows(),
    };
    Json(list)
}

/// GET /api/workflows/{id}: one workflow, active or retained.
pub async fn get_workflow(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowExecution>, AppError> {
    app.monitor
        .get_workflow(&id)?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("workflow not found: {id}")))
}

/// GET /api/executions/{agent}/{task}: latest execution for the pair.
pub async fn get_execution(
    State(app): State<AppState>,
    Path((agent, task)): Path<(String, String)>,
) -> Result<Json<AgentExecution>, AppError> {
    app.monitor
        .find_execution(&agent, &task)?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no execution for {agent}/{task}")))
}
