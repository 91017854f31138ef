use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowwatch_core::error::SinkError;
use flowwatch_core::MonitorError;

// ---------------------------------------------------------------------------
// Internal sentinel for explicit 404 Not Found errors
// ---------------------------------------------------------------------------

/// Private sentinel error type used to carry an explicit HTTP 404 through
/// the `anyhow::Error` chain for lookups that return `None`.
#[derive(Debug)]
struct NotFoundError(String);

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NotFoundError {}

/// Request body that did not decode as an event. Keeps the extractor's
/// status (400 syntax, 415 content type, 422 shape).
#[derive(Debug)]
struct InvalidEventError {
    status: StatusCode,
    message: String,
}

impl std::fmt::Display for InvalidEventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for InvalidEventError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses. The body is
/// `{ "error": <message>, "kind": <stable tag> }`.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// Construct a 404 Not Found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(NotFoundError(msg.into()).into())
    }

    /// Construct an error for an event body the JSON extractor refused.
    pub fn invalid_event(rejection: JsonRejection) -> Self {
        Self(
            InvalidEventError {
                status: rejection.status(),
                message: rejection.body_text(),
            }
            .into(),
        )
    }

    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        if self.0.downcast_ref::<NotFoundError>().is_some() {
            return (StatusCode::NOT_FOUND, "not_found");
        }
        if let Some(e) = self.0.downcast_ref::<InvalidEventError>() {
            return (e.status, "invalid_event");
        }
        if let Some(e) = self.0.downcast_ref::<MonitorError>() {
            let status = match e {
                MonitorError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
                MonitorError::DuplicateWorkflow(_) | MonitorError::DuplicateExecution { .. } => {
                    StatusCode::CONFLICT
                }
                MonitorError::InvalidTransition { .. }
                | MonitorError::InvalidPhaseTransition { .. }
                | MonitorError::UnknownPhase { .. }
                | MonitorError::DanglingExecution { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                MonitorError::Corrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return (status, e.kind());
        }
        if self.0.downcast_ref::<SinkError>().is_some() {
            return (StatusCode::SERVICE_UNAVAILABLE, "persistence_unavailable");
        }
        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let body = serde_json::json!({ "error": self.0.to_string(), "kind": kind });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
