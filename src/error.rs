//! Crate-wide error type for the orchestration core.
//!
//! Mirrors the error kinds of the core's error-handling design: caller
//! mistakes are not retried, storage/network hiccups are, and agent/config
//! failures carry enough context to build the per-step status summary a
//! caller sees on workflow failure.

use thiserror::Error;

/// The error kinds the core can surface, matching its propagation policy:
/// `BadInput`/`AccessDenied`/`NotFound`/`FatalConfig` are terminal and never
/// retried; `Transient`/`AgentFailed` drive the workflow engine's retry loop;
/// `Cancelled` is cooperative and not a failure; `ResolveDropped` is logged
/// and non-fatal.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller-supplied data is malformed: unknown template, cyclic plan,
    /// missing required fields.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Principal lacks rights over the referenced resource.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Referenced workflow/conversation/proposal/document does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage or network error deemed retriable by the caller.
    #[error("transient error: {0}")]
    Transient(String),

    /// An agent returned a failure result.
    #[error("agent failed: {0}")]
    AgentFailed(String),

    /// Unknown agent type or corrupt template; not retried.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// Cooperative cancellation; not treated as a failure by callers.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// Whether a step that failed with this error should be retried
    /// (subject to `max_retries`), per the core's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::AgentFailed(_))
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Transient(format!("sqlite: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::BadInput(format!("json: {e}"))
    }
}

/// Result alias used throughout the crate's public API.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(CoreError::Transient("x".into()).is_retryable());
        assert!(CoreError::AgentFailed("x".into()).is_retryable());
        assert!(!CoreError::BadInput("x".into()).is_retryable());
        assert!(!CoreError::FatalConfig("x".into()).is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
    }
}
