//! Engine-level error taxonomy

use thiserror::Error;

use crate::models::SessionStatus;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the session engine.
///
/// Lower layers carry their own error enums; they are bridged here with
/// string payloads at the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Socket-level failure (connect, send, receive, timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame, bad checksum, unsupported PID
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device rejected the handshake. Terminal, never retried.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Device missing, retired, or already leased
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Connection dropped mid-session and not recovered in time
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// AI collaborator down or over its deadline. Degrades, never fatal.
    #[error("Analysis unavailable: {0}")]
    AnalysisUnavailable(String),

    /// Illegal session state transition
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// No session registered under the given id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Request rejected before any side effect
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Bug-grade internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable code for logs and events
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Transport(_) => "transport",
            EngineError::Protocol(_) => "protocol",
            EngineError::Authentication(_) => "authentication",
            EngineError::DeviceUnavailable(_) => "device_unavailable",
            EngineError::ConnectionLost(_) => "connection_lost",
            EngineError::AnalysisUnavailable(_) => "analysis_unavailable",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::Invalid(_) => "invalid",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same call can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_)
                | EngineError::DeviceUnavailable(_)
                | EngineError::ConnectionLost(_)
                | EngineError::AnalysisUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_not_retryable() {
        assert!(!EngineError::Authentication("bad secret".into()).is_retryable());
        assert!(EngineError::DeviceUnavailable("leased".into()).is_retryable());
    }

    #[test]
    fn test_transition_code() {
        let err = EngineError::InvalidTransition {
            from: SessionStatus::Initiated,
            to: SessionStatus::Completed,
        };
        assert_eq!(err.code(), "invalid_transition");
        assert_eq!(
            err.to_string(),
            "Invalid session transition: initiated -> completed"
        );
    }
}
