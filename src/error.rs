//! Error types for the matchlink client.

use thiserror::Error;

use crate::session::SessionPhase;

/// Errors that can occur when using the matchlink client.
#[derive(Debug, Error)]
pub enum MatchLinkError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection, but the client is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The server has not yet confirmed the local participant on this connection.
    #[error("participant not created on the current connection")]
    ParticipantNotCreated,

    /// A match was requested while another session is still live.
    #[error("a matchmaking session is already active (phase: {phase})")]
    SessionActive {
        /// Phase of the session that is still live.
        phase: SessionPhase,
    },

    /// The operation is not valid from the current phase.
    #[error("cannot {operation} while {phase}")]
    InvalidPhase {
        /// Name of the rejected operation.
        operation: &'static str,
        /// Phase the session was in.
        phase: SessionPhase,
    },

    /// The "already in a room" recovery gave up.
    #[error("matchmaking recovery gave up after {attempts} attempts")]
    RetryExhausted {
        /// Number of reconnect attempts made.
        attempts: u32,
    },

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for matchlink client operations.
pub type Result<T> = std::result::Result<T, MatchLinkError>;
