use thiserror::Error;

/// Error kinds from `spec.md` §7 — not transport types. Each carries a
/// stable `code()` string mirroring `SkynetError::code()`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session '{session_id}' is busy with run '{run_id}'")]
    SessionBusy { session_id: String, run_id: String },

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("action '{0}' requires confirmation")]
    ActionRequiresConfirmation(String),

    #[error("runtime '{mode}' unavailable: {reason}")]
    RuntimeUnavailable { mode: String, reason: String },

    #[error("run timed out")]
    Timeout,

    #[error("run cancelled")]
    Cancelled,

    #[error("max tool calls ({0}) exceeded")]
    ToolCallLimitExceeded(u32),

    #[error("empty stream")]
    EmptyStream,

    #[error("upstream error: {0}")]
    UpstreamError(String),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidRequest(_) => "invalid_request",
            OrchestratorError::SessionBusy { .. } => "session_busy",
            OrchestratorError::ActionNotFound(_) => "action_not_found",
            OrchestratorError::ActionRequiresConfirmation(_) => "action_requires_confirmation",
            OrchestratorError::RuntimeUnavailable { .. } => "runtime_unavailable",
            OrchestratorError::Timeout => "timeout",
            OrchestratorError::Cancelled => "cancelled",
            OrchestratorError::ToolCallLimitExceeded(_) => "tool_call_limit_exceeded",
            OrchestratorError::EmptyStream => "empty_stream",
            OrchestratorError::UpstreamError(_) => "upstream_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
