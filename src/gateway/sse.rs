use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use super::AppState;
use crate::logs::LogEvent;

/// `GET /agent/logs/stream/:session_id`: replay the session's buffered
/// log events, then stream live ones.
///
/// The hub subscription lives inside the stream, so a client disconnect
/// drops it.  In-flight instructions are unaffected.
pub(crate) async fn log_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(e) = crate::utils::validate_path_segment(&session_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
        )
            .into_response();
    }

    let (history, mut rx, guard) = state.orchestrator.hub().subscribe(&session_id);
    let shutdown = state.shutdown.clone();
    debug!(session_id = %session_id, replay = history.len(), "log stream opened");

    let stream = async_stream::stream! {
        let _guard = guard;
        for event in history {
            yield Ok::<Event, Infallible>(to_sse(&event));
        }
        loop {
            let next = tokio::select! {
                event = rx.recv() => event,
                _ = shutdown.cancelled() => None,
            };
            match next {
                Some(event) => yield Ok(to_sse(&event)),
                None => break,
            }
        }
    };

    let interval = Duration::from_secs(state.config.logs.keep_alive_secs.max(1));
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(interval).text("keep-alive"))
        .into_response()
}

fn to_sse(event: &LogEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data(&event.message))
}
