//! Session-scoped types: the phase graph, the per-session context and the
//! read-only view published to renderers.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::identity::Position;
use crate::protocol::{ConnectionId, MatchRequest};
use crate::room::RoomSnapshot;

pub use crate::protocol::SessionId;

/// Phase of the matchmaking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session.
    #[default]
    Idle,
    /// Match requested, no room yet.
    Matchmaking,
    /// First room snapshot received.
    RoomJoined,
    /// In a room, waiting for the second participant.
    WaitingForPlayers,
    /// Both participants present or ready; hand-off scheduled.
    BothReady,
    /// Hand-off latched; no further triggers until the next session.
    GameStarting,
}

impl SessionPhase {
    /// Returns `true` if `next` is an edge of the phase graph.
    ///
    /// Any phase may return to [`Idle`](Self::Idle).
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::{BothReady, GameStarting, Idle, Matchmaking, RoomJoined, WaitingForPlayers};
        matches!(
            (self, next),
            (_, Idle)
                | (Idle, Matchmaking)
                | (Matchmaking, RoomJoined)
                | (RoomJoined, WaitingForPlayers)
                | (RoomJoined, BothReady)
                | (WaitingForPlayers, BothReady)
                | (BothReady, GameStarting)
        )
    }

    /// Returns `true` while a room exists for the session.
    pub fn in_room(self) -> bool {
        matches!(
            self,
            Self::RoomJoined | Self::WaitingForPlayers | Self::BothReady | Self::GameStarting
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Matchmaking => "matchmaking",
            Self::RoomJoined => "room joined",
            Self::WaitingForPlayers => "waiting for players",
            Self::BothReady => "both ready",
            Self::GameStarting => "game starting",
        };
        f.write_str(name)
    }
}

/// State that lives exactly as long as one session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Session identifier.
    pub id: SessionId,
    /// Request that opened the session; re-sent by the recovery path.
    pub request: MatchRequest,
    /// Resolved seat of the local participant.
    pub position: Position,
    /// Reconnect attempts made by the "already in a room" recovery.
    pub retry_attempts: u32,
}

impl SessionContext {
    /// Context for a freshly requested session.
    pub fn new(request: MatchRequest) -> Self {
        Self {
            id: request.session_id,
            request,
            position: Position::Unassigned,
            retry_attempts: 0,
        }
    }
}

/// Read-only snapshot of session state for renderers.
///
/// Rebuilt and swapped whole after every processed input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionView {
    /// Current phase.
    pub phase: SessionPhase,
    /// Live session, if any.
    pub session: Option<SessionId>,
    /// Latest room snapshot.
    pub room: Option<Arc<RoomSnapshot>>,
    /// Local connection identifier reported by the transport.
    pub connection_id: Option<ConnectionId>,
    /// Resolved seat of the local participant.
    pub position: Position,
    /// Whether the transport reports a live connection.
    pub connected: bool,
    /// Whether the server has registered the local participant on this connection.
    pub participant_created: bool,
}

impl SessionView {
    /// Returns `true` if a match request would be accepted right now.
    pub fn can_request_match(&self) -> bool {
        self.connected && self.participant_created && self.phase == SessionPhase::Idle
    }

    /// Number of participants in the current room (0 outside a room).
    pub fn participants_in_room(&self) -> usize {
        self.room.as_ref().map_or(0, |r| r.participant_count())
    }
}
