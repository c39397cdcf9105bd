//! Wire types for the matchmaking event protocol.
//!
//! Every message is an envelope `{"event": "<name>", "data": <payload>}`.
//! Inbound payloads are parsed leniently: the server has shipped several
//! field spellings over time, so identifiers are read from whichever legacy
//! field is present and shape mismatches degrade to `None` instead of failing
//! the whole event. Only text that is not a JSON envelope at all is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::error_codes::ErrorCode;

// ── Identifiers ─────────────────────────────────────────────────────

/// Transport-level identifier of one connected participant.
pub type ConnectionId = String;

/// Identifier of one matchmaking session (request → hand-off or cancel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random session identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Legacy field names that carry a participant's identifier inside `players`.
const PARTICIPANT_ID_FIELDS: &[&str] = &["socketId", "id", "playerId"];

/// Legacy field names that carry the identifier on a ready event.
const READY_ID_FIELDS: &[&str] = &["socketId", "playerId", "id"];

/// Field names for the authoritative "everyone is ready" flag.
const ALL_READY_FIELDS: &[&str] = &["allReady", "allPlayersReady"];

const ROOM_ID_FIELDS: &[&str] = &["roomId", "room_id"];

// ── Inbound payloads ────────────────────────────────────────────────

/// One participant entry from a room payload, normalized to a single identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantRef {
    /// `None` when the entry carried no recognizable identifier.
    pub connection_id: Option<ConnectionId>,
}

impl ParticipantRef {
    /// A participant with a known identifier.
    pub fn new(connection_id: impl Into<ConnectionId>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
        }
    }

    /// A participant whose identifier is unknown (inferred or malformed entry).
    pub fn anonymous() -> Self {
        Self {
            connection_id: None,
        }
    }

    fn from_value(value: &Value) -> Self {
        Self {
            connection_id: first_identifier(value, PARTICIPANT_ID_FIELDS),
        }
    }
}

/// Payload of `room-joined` and `participant-joined-room`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPayload {
    /// Server-side room identifier, if sent.
    pub room_id: Option<String>,
    /// `None` when the `players` field was missing or not an array.
    pub players: Option<Vec<ParticipantRef>>,
    /// Session echoed back by the server, if any.
    pub session_tag: Option<SessionId>,
}

impl RoomPayload {
    /// A well-formed payload listing the given participant identifiers.
    pub fn with_players<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ConnectionId>,
    {
        Self {
            room_id: None,
            players: Some(ids.into_iter().map(ParticipantRef::new).collect()),
            session_tag: None,
        }
    }

    fn from_value(data: &Value) -> Self {
        Self {
            room_id: first_identifier(data, ROOM_ID_FIELDS),
            players: data
                .get("players")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().map(ParticipantRef::from_value).collect()),
            session_tag: session_tag(data),
        }
    }
}

/// Payload of `participant-ready`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyPayload {
    /// Participant that signalled ready, if identifiable.
    pub connection_id: Option<ConnectionId>,
    /// Authoritative "everyone is ready" flag.
    pub all_ready: bool,
    /// Room the signal belongs to, if sent.
    pub room_id: Option<String>,
    /// Session echoed back by the server, if any.
    pub session_tag: Option<SessionId>,
}

impl ReadyPayload {
    /// A ready signal from the given participant.
    pub fn from_participant(connection_id: impl Into<ConnectionId>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            ..Self::default()
        }
    }

    fn from_value(data: &Value) -> Self {
        Self {
            connection_id: first_identifier(data, READY_ID_FIELDS),
            all_ready: ALL_READY_FIELDS
                .iter()
                .any(|field| data.get(field).and_then(Value::as_bool) == Some(true)),
            room_id: first_identifier(data, ROOM_ID_FIELDS),
            session_tag: session_tag(data),
        }
    }
}

/// Payload of `error`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Error category from the `type` field (e.g. `"GAME_ERROR"`).
    pub kind: Option<String>,
    /// Human-readable message. Empty when the server sent none.
    pub message: String,
    /// Structured code, when the server sends one this client understands.
    pub code: Option<ErrorCode>,
}

impl ErrorPayload {
    fn from_value(data: &Value) -> Self {
        Self {
            kind: data.get("type").and_then(Value::as_str).map(str::to_owned),
            message: data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            code: data
                .get("code")
                .and_then(|code| serde_json::from_value(code.clone()).ok()),
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// Raw envelope as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload; `null` when absent.
    #[serde(default)]
    pub data: Value,
}

/// Events pushed by the matchmaking server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The server registered the local participant; matchmaking may start.
    ParticipantCreated,
    /// The local participant entered a room (full snapshot).
    RoomJoined(RoomPayload),
    /// Someone entered the room the local participant is in (full snapshot).
    ParticipantJoinedRoom(RoomPayload),
    /// A participant signalled readiness.
    ParticipantReady(ReadyPayload),
    /// The local participant left the room.
    LeftRoom,
    /// The server reported an error.
    Error(ErrorPayload),
    /// An event this client does not handle.
    Unknown(String),
}

impl InboundEvent {
    /// Parse one envelope from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`MatchLinkError::Serialization`](crate::MatchLinkError::Serialization)
    /// if the text is not a JSON object with an `event` string.
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Ok(Self::from_envelope(&envelope))
    }

    /// Interpret an already-decoded envelope. Never fails.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let data = &envelope.data;
        match envelope.event.as_str() {
            "participant-created" | "player-created" => Self::ParticipantCreated,
            "room-joined" => Self::RoomJoined(RoomPayload::from_value(data)),
            "participant-joined-room" | "player-joined-room" => {
                Self::ParticipantJoinedRoom(RoomPayload::from_value(data))
            }
            "participant-ready" | "player-ready" => {
                Self::ParticipantReady(ReadyPayload::from_value(data))
            }
            "left-room" => Self::LeftRoom,
            "error" => Self::Error(ErrorPayload::from_value(data)),
            other => Self::Unknown(other.to_owned()),
        }
    }

    /// Canonical event name, for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::ParticipantCreated => "participant-created",
            Self::RoomJoined(_) => "room-joined",
            Self::ParticipantJoinedRoom(_) => "participant-joined-room",
            Self::ParticipantReady(_) => "participant-ready",
            Self::LeftRoom => "left-room",
            Self::Error(_) => "error",
            Self::Unknown(name) => name,
        }
    }
}

/// Parameters of one match request. Re-sent verbatim by the recovery path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    /// Session this request belongs to; servers may echo it back.
    pub session_id: SessionId,
    /// Local connection identifier at the time of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    /// Variant (character/skin) chosen by the local participant.
    pub selected_variant: u32,
}

/// Commands sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundCommand {
    /// Ask to be paired with another participant.
    FindMatch(MatchRequest),
    /// Withdraw a pending match request.
    CancelMatchmaking,
}

// ── Lenient field access ────────────────────────────────────────────

fn identifier(value: &Value) -> Option<ConnectionId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_identifier(object: &Value, fields: &[&str]) -> Option<ConnectionId> {
    fields
        .iter()
        .find_map(|field| object.get(field).and_then(identifier))
}

fn session_tag(data: &Value) -> Option<SessionId> {
    data.get("sessionId")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .map(SessionId::from)
}
