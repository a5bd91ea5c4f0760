use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::provider::Message;

/// Request to start a run against a `Runtime` (§4.1).
#[derive(Debug, Clone)]
pub struct ChatStreamRequest {
    /// Backend-side session identifier, if one is already known.
    pub session_id: Option<String>,
    pub message: String,
    pub max_tool_calls: u32,
}

/// A transcript entry returned by `Runtime::get_history`.
pub type ChatMessage = Message;

/// Events in a runtime's native schema, emitted before the orchestrator
/// stamps `run_id`/`seq`/`ts` and maps them onto the canonical protocol (C4).
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// First event of a run. `backend_session_id` is the runtime's own
    /// session handle (only meaningful for the Gateway Runtime); the
    /// orchestrator captures it into the session map and never forwards it
    /// to clients verbatim.
    Start { backend_session_id: Option<String> },
    Text { delta: String },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool: String,
        ok: bool,
        summary: String,
    },
    Status { message: String },
    Error { message: String },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        context_window: Option<u64>,
        remaining_tokens: Option<u64>,
    },
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Backend cannot serve the request for a reason the orchestrator may
    /// recover from — missing URL, auth failure, network error, HTTP
    /// 401/403 from the gateway.
    #[error("runtime '{mode}' unavailable: {reason}")]
    Unavailable { mode: String, reason: String },

    #[error("runtime error: {0}")]
    Other(String),
}

/// A session found in backend-side storage that the in-memory session
/// registry doesn't know about yet — surfaced after a process restart
/// (§4.8 recovery).
#[derive(Debug, Clone)]
pub struct RecoveredSession {
    pub session_id: String,
    pub last_used_at: i64,
}

/// Common interface for both runtime backends (§4.1). Implemented by
/// `DirectKeyRuntime` (C2) and `GatewayRuntime` (C3).
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Identity tag — one of `"direct_key"` or `"gateway"`.
    fn mode(&self) -> &str;

    /// Whether this backend can currently execute a run.
    async fn available(&self) -> bool;

    /// Start a run and return a channel of upstream events.
    async fn chat_stream(
        &self,
        person: &str,
        request: ChatStreamRequest,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, RuntimeError>;

    /// Drop any backend-side state held for a session.
    async fn clear_session(&self, person: &str, session_id: &str) -> Result<(), RuntimeError>;

    /// Return the backend-side transcript for a session, if any.
    async fn get_history(
        &self,
        person: &str,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, RuntimeError>;

    /// Scan backend-side storage for sessions not reflected in the
    /// registry, newest-first, bounded to `limit`. Default: none — only a
    /// backend with its own durable storage (the Gateway Runtime's
    /// transcript directory) has anything to recover.
    async fn recover_sessions(&self, _person: &str, _limit: usize) -> Vec<RecoveredSession> {
        Vec::new()
    }
}
