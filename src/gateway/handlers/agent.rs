use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Deserializer};

use crate::agent::ResponseStatus;
use crate::gateway::AppState;
use crate::utils::validate_path_segment;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AskRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default, deserialize_with = "file_hints")]
    file_hints: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContextRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// `fileHints` arrives either as a list or as one comma-separated string.
#[derive(Deserialize)]
#[serde(untagged)]
enum FileHints {
    List(Vec<String>),
    Joined(String),
}

fn file_hints<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let hints = match Option::<FileHints>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(FileHints::List(list)) => list,
        Some(FileHints::Joined(joined)) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(hints
        .into_iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect())
}

/// Trimmed, non-empty, path-safe session id.
fn session_id(raw: Option<String>) -> Result<String, String> {
    let id = raw.unwrap_or_default().trim().to_string();
    if id.is_empty() {
        return Err("sessionId is required".to_string());
    }
    validate_path_segment(&id).map_err(|e| e.to_string())?;
    Ok(id)
}

fn ask_error(session_id: &str, error: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "sessionId": session_id,
            "status": ResponseStatus::Error,
            "operations": [],
            "logs": [],
            "error": error.into(),
        })),
    )
        .into_response()
}

/// `POST /agent/ask`: run one instruction.
pub(crate) async fn ask(
    State(state): State<AppState>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return ask_error("", rejection.body_text()),
    };
    let session_id = match session_id(req.session_id) {
        Ok(id) => id,
        Err(e) => return ask_error("", e),
    };
    let instruction = req.instruction.unwrap_or_default();
    if instruction.trim().is_empty() {
        return ask_error(&session_id, "instruction is required");
    }

    let response = state
        .orchestrator
        .process_instruction(&session_id, instruction.trim(), &req.file_hints)
        .await;
    Json(response).into_response()
}

/// `POST /agent/context`: stage a context chunk for the next instruction.
pub(crate) async fn context(
    State(state): State<AppState>,
    body: Result<Json<ContextRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return context_error("", rejection.body_text()),
    };
    let session_id = match session_id(req.session_id) {
        Ok(id) => id,
        Err(e) => return context_error("", e),
    };

    let response = state
        .orchestrator
        .append_context(&session_id, req.content.as_deref().unwrap_or(""))
        .await;
    let code = match response.status {
        ResponseStatus::Success => StatusCode::OK,
        ResponseStatus::Error => StatusCode::BAD_REQUEST,
    };
    (code, Json(response)).into_response()
}

fn context_error(session_id: &str, message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "sessionId": session_id,
            "status": ResponseStatus::Error,
            "pendingChunkCount": 0,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// `GET /agent/history/:session_id`: durable chat records.
pub(crate) async fn history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(e) = validate_path_segment(&session_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "sessionId": session_id,
                "status": ResponseStatus::Error,
                "history": [],
                "error": e.to_string(),
            })),
        )
            .into_response();
    }
    Json(state.orchestrator.chat_history(&session_id).await).into_response()
}
