//! Error codes carried on server `error` events.
//!
//! Codes serialize using `SCREAMING_SNAKE_CASE`. Older servers send only a
//! free-form `message`, so classification also falls back to matching the
//! message text (see [`is_already_in_room`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message fragment the server uses when a participant is still seated in a room.
pub const ALREADY_IN_ROOM_MESSAGE: &str = "already in a room";

/// Structured error codes returned by the matchmaking server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Room errors
    AlreadyInRoom,
    RoomNotFound,
    RoomFull,
    NotInRoom,

    // Matchmaking errors
    MatchmakingUnavailable,
    InvalidVariant,

    // Validation errors
    InvalidInput,

    // Rate limiting
    RateLimitExceeded,

    // Server errors
    InternalError,
}

/// What the session logic does in response to an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Force a fresh transport connection, then re-issue the match request.
    ReconnectAndRetry,
    /// Hand the error to the operator; no automatic recovery.
    Surface,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::AlreadyInRoom => {
                "The participant is still seated in a previous room. The client will reconnect and retry."
            }
            Self::RoomNotFound => "The room could not be found. It may have been closed.",
            Self::RoomFull => "The room already holds two participants.",
            Self::NotInRoom => "The participant is not in any room.",
            Self::MatchmakingUnavailable => {
                "Matchmaking is temporarily unavailable. Please try again shortly."
            }
            Self::InvalidVariant => "The selected variant is not owned by this participant.",
            Self::InvalidInput => "The request was malformed.",
            Self::RateLimitExceeded => "Too many requests in a short time. Please slow down.",
            Self::InternalError => "An internal server error occurred.",
        }
    }

    /// Returns the recovery action associated with this code.
    pub fn recovery(&self) -> Recovery {
        match self {
            Self::AlreadyInRoom => Recovery::ReconnectAndRetry,
            _ => Recovery::Surface,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Returns `true` if an error event reports the "already in a room" conflict.
///
/// A structured [`ErrorCode::AlreadyInRoom`] is checked first; otherwise the message is
/// matched case-insensitively against [`ALREADY_IN_ROOM_MESSAGE`].
pub fn is_already_in_room(code: Option<&ErrorCode>, message: &str) -> bool {
    if let Some(code) = code {
        if code.recovery() == Recovery::ReconnectAndRetry {
            return true;
        }
    }
    message.to_ascii_lowercase().contains(ALREADY_IN_ROOM_MESSAGE)
}
