//! Error types for Tether
//!
//! All errors are managed centrally here.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Tether error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Client-facing
    // ========================================================================
    #[error("Unknown action type: {0}")]
    UnknownAction(String),

    #[error("Unknown task: {0}")]
    UnknownTask(u64),

    #[error("Not the leader{}", leader_hint(.leader))]
    NotLeader { leader: Option<String> },

    // ========================================================================
    // Assignment
    // ========================================================================
    #[error("No eligible node for executor pool: {pool}")]
    NoEligibleNode { pool: String },

    // ========================================================================
    // Registry
    // ========================================================================
    #[error("Action type already registered: {0}")]
    DuplicateAction(String),

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // General
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // External error conversion
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // Other
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

fn leader_hint(leader: &Option<String>) -> String {
    match leader {
        Some(node) => format!(" (current leader: {})", node),
        None => String::new(),
    }
}

impl Error {
    /// Whether a failed execution should be handed to another node
    /// rather than terminating the task.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::NoEligibleNode { .. } | Error::Io(_)
        )
    }

    /// Whether this error is surfaced synchronously to the caller
    /// instead of being recovered internally.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownAction(_)
                | Error::UnknownTask(_)
                | Error::NotLeader { .. }
                | Error::DuplicateAction(_)
                | Error::InvalidInput(_)
        )
    }

    /// Task execution failure helper
    pub fn task_failed(reason: impl Into<String>) -> Self {
        Error::TaskFailed(reason.into())
    }
}

// ============================================================================
// From conversions
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
