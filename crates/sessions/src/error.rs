use thiserror::Error;

/// Errors that can occur during session registry / conversation store operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No record exists for this (person, session_id) pair.
    #[error("session not found: {session_id}")]
    NotFound { session_id: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;
