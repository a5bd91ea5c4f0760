//! Streaming chat endpoint — POST /v1/chat-stream
//!
//! The one route this binary exists to expose (§6.1): accepts a chat/action
//! request, drives `Orchestrator::chat_stream`, and writes each canonical
//! event back to the client as one NDJSON line.
//!
//! Auth: `Authorization: Bearer <token>` header, same token-comparison idiom
//! the teacher codebase uses for its own `/chat` endpoint.
//!
//! Request:  `{"session_id"?: string, "message"?: string, "action_id"?: string, "confirm"?: bool}`
//! Response: `application/x-ndjson`, one canonical event (§4.4) per line.
//! Error (pre-stream only): `{"error": "...", "code": "..."}`

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use notes_core::config::GatewayAuthMode;
use notes_core::PersonId;
use notes_orchestrator::{ChatRequest, OrchestratorError};

use crate::app::AppState;

#[derive(Deserialize)]
pub struct ChatStreamBody {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Serialize)]
pub struct ChatStreamError {
    pub error: String,
    pub code: String,
}

/// POST /v1/chat-stream — streams canonical events as NDJSON.
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatStreamBody>,
) -> Response {
    if !check_auth(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ChatStreamError {
                error: "Unauthorized. Set 'Authorization: Bearer <your-token>' header.".to_string(),
                code: "unauthorized".to_string(),
            }),
        )
            .into_response();
    }

    let person = PersonId::from(state.config.gateway.auth.person_id.clone());

    let request = ChatRequest {
        session_id: req.session_id,
        message: req.message,
        action_id: req.action_id,
        confirm: req.confirm,
    };

    let handle = match state.orchestrator.chat_stream(&person, request).await {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, code = e.code(), "chat-stream request rejected");
            return (status_for(&e), Json(ChatStreamError { error: e.to_string(), code: e.code().to_string() }))
                .into_response();
        }
    };

    let body_stream = ReceiverStream::new(handle.events).map(|event| {
        let mut line = serde_json::to_vec(&event).unwrap_or_default();
        line.push(b'\n');
        Ok::<_, std::io::Error>(line)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::SessionBusy { .. } => StatusCode::CONFLICT,
        OrchestratorError::ActionNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::ActionRequiresConfirmation(_) => StatusCode::PRECONDITION_REQUIRED,
        OrchestratorError::RuntimeUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Returns true if the request is authorised.
pub(crate) fn check_auth(state: &AppState, headers: &HeaderMap) -> bool {
    match state.config.gateway.auth.mode {
        GatewayAuthMode::None => true,
        GatewayAuthMode::Token => {
            let expected = match state.config.gateway.auth.token.as_deref() {
                Some(t) => t,
                // Token mode configured but no token value — deny.
                None => return false,
            };
            extract_bearer(headers).map(|t| t == expected).unwrap_or(false)
        }
    }
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
