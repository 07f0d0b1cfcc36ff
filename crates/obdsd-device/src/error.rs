//! Device layer errors

use obdsd_core::ConnectionState;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors from one device connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Device refused the seed-key exchange. Terminal, never retried.
    #[error("Authentication rejected by device")]
    AuthenticationRejected,

    /// Handshake frames did not follow the link protocol
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake did not finish inside the handshake window
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Connection is not in a command-capable state
    #[error("Connection not ready: {0}")]
    NotReady(ConnectionState),

    /// Device answered a command with a link-level rejection
    #[error("Device link error: {0}")]
    Link(String),

    /// A sampling loop is already running on this connection
    #[error("Streaming already active")]
    AlreadyStreaming,
}

impl ConnectionError {
    /// Whether the underlying link is gone (as opposed to one failed command)
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ConnectionError::Transport(TransportError::ConnectionClosed)
                | ConnectionError::Transport(TransportError::ConnectionFailed(_))
                | ConnectionError::NotReady(_)
        )
    }
}

/// Errors from the connection hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Device not registered: {0}")]
    DeviceNotFound(String),

    #[error("Device already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Device retired: {0}")]
    DeviceRetired(String),

    /// Device is leased to another session or an acquire is in flight
    #[error("Device unavailable: {0}")]
    DeviceBusy(String),

    /// Handshake rejected; the acquire aborts without trying other transports
    #[error("Authentication rejected for device {serial}")]
    AuthenticationRejected { serial: String },

    #[error("All transports failed for device {serial}: {last_error}")]
    AllTransportsFailed { serial: String, last_error: String },
}
