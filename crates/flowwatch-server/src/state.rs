use flowwatch_core::Monitor;
use std::sync::Arc;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
}

impl AppState {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }
}
