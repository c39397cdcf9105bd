//! Events delivered to downstream consumers.

use std::sync::Arc;

use crate::identity::Position;
use crate::readiness::ReadinessSet;
use crate::room::RoomSnapshot;
use crate::session::{SessionId, SessionPhase};

/// What caused the session to start the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartTrigger {
    /// The room reached two participants.
    Population,
    /// Both participants signalled ready (or the server declared it).
    Readiness,
}

/// The one-time transfer of control to the gameplay subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandOff {
    /// Session that produced the hand-off.
    pub session: SessionId,
    /// Seat of the local participant.
    pub position: Position,
    /// Room as last seen before the hand-off.
    pub room: Option<Arc<RoomSnapshot>>,
    /// Variant the local participant plays with.
    pub selected_variant: u32,
    /// Path that led to the start.
    pub trigger: StartTrigger,
}

/// Events emitted by [`MatchLinkClient`](crate::client::MatchLinkClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchLinkEvent {
    /// Synthetic: the session task started on a live transport.
    Connected,
    /// The server registered the local participant.
    ParticipantCreated,
    /// The session moved between phases.
    PhaseChanged {
        /// Session the transition belongs to (`None` when leaving a session
        /// that was already torn down).
        session: Option<SessionId>,
        /// Previous phase.
        from: SessionPhase,
        /// New phase.
        to: SessionPhase,
    },
    /// A room event replaced the snapshot.
    RoomUpdated {
        /// Owning session.
        session: SessionId,
        /// New snapshot.
        room: Arc<RoomSnapshot>,
    },
    /// The local seat was resolved for the first time this session.
    PositionResolved {
        /// Owning session.
        session: SessionId,
        /// Resolved seat.
        position: Position,
    },
    /// The readiness set changed.
    ReadinessChanged {
        /// Owning session.
        session: SessionId,
        /// Identifiers that are ready.
        ready: ReadinessSet,
    },
    /// The "already in a room" recovery scheduled a reconnect.
    RecoveryStarted {
        /// Owning session.
        session: SessionId,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Control passes to gameplay. Emitted at most once per session.
    HandOff(HandOff),
    /// The session was abandoned after recovery failed.
    MatchmakingFailed {
        /// Abandoned session.
        session: SessionId,
        /// Why it was abandoned.
        reason: String,
    },
    /// A server error that needs operator attention.
    ServerError {
        /// Error category (`type` field), if sent.
        kind: Option<String>,
        /// Server message.
        message: String,
    },
    /// Synthetic: the transport closed. Always the last event.
    Disconnected {
        /// Human-readable reason, if known.
        reason: Option<String>,
    },
}

impl MatchLinkEvent {
    /// Events that must never be dropped under back-pressure.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::HandOff(_) | Self::Disconnected { .. })
    }
}
