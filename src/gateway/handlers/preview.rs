use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::config::Config;
use crate::gateway::AppState;
use crate::preview::PreviewStatus;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    status: PreviewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `POST /preview/start`
pub(crate) async fn start(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let result = state.preview.start().await;
    let preview_url = matches!(result.status, PreviewStatus::Running | PreviewStatus::Starting)
        .then(|| preview_url(&state.config, &headers, crate::utils::now_millis()));
    Json(StartResponse {
        status: result.status,
        preview_url,
        error: result.error,
    })
}

/// `POST /preview/stop`
pub(crate) async fn stop(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": state.preview.stop().await }))
}

/// `GET /preview/status`
pub(crate) async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.preview.status().await)
}

/// Public URL of the preview, with a cache-busting query.
///
/// Base precedence: `public_preview_url` (only if it is an http(s) URL),
/// then `public_base_url`, then the forwarded or direct request host.
pub fn preview_url(config: &Config, headers: &HeaderMap, now_millis: u64) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let base = match config
        .public_preview_url
        .as_deref()
        .filter(|u| u.starts_with("http"))
    {
        Some(url) => url.to_string(),
        None => match &config.public_base_url {
            Some(url) => url.clone(),
            None => {
                let proto = header("x-forwarded-proto").unwrap_or("http");
                let host = header("x-forwarded-host")
                    .or_else(|| header("host"))
                    .unwrap_or("localhost:3000");
                format!("{proto}://{host}")
            }
        },
    };

    format!(
        "{}/?ngrok-skip-browser-warning=true&t={now_millis}",
        base.trim_end_matches('/')
    )
}
