use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use flowwatch_core::Notification;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::state::AppState;

/// SSE event name and JSON payload for one notification.
fn to_event(n: &Notification) -> Option<Event> {
    let name = match n {
        Notification::Change(_) => "change",
        Notification::Degraded { .. } => "degraded",
    };
    Event::default().event(name).json_data(n).ok()
}

/// GET /api/stream: SSE stream of persisted changes and `degraded` alerts.
///
/// Delivery is at-least-once; subscribers that lag past the buffer miss
/// notifications and should re-query.
pub async fn sse_stream(State(app): State<AppState>) -> impl axum::response::IntoResponse {
    let rx = app.monitor.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        msg.ok()
            .and_then(|n| to_event(&n))
            .map(Ok::<Event, Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
