use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use flowwatch_core::{MonitorEvent, StateChange};

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/events: ingest one lifecycle event.
///
/// 202 with the recorded change once the event is accepted; persistence
/// happens in the background. Bodies that do not decode as an event get the
/// same `{error, kind}` shape as monitor rejections.
pub async fn ingest_event(
    State(app): State<AppState>,
    payload: Result<Json<MonitorEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<StateChange>), AppError> {
    let Json(event) = payload.map_err(AppError::invalid_event)?;
    let change = app.monitor.ingest(event)?;
    Ok((StatusCode::ACCEPTED, Json(change)))
}
