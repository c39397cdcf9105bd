//! Canonical snapshot of the room the local participant is in.
//!
//! Every room-related event yields a complete replacement [`RoomSnapshot`];
//! snapshots are never edited in place. The store hands out `Arc`s so readers
//! hold either the old or the new snapshot, never a half-applied one.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::protocol::{ParticipantRef, RoomPayload};

/// Rooms hold at most this many participants.
pub const MAX_PARTICIPANTS: usize = 2;

/// Normalized view of one room, as of the latest room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    /// Server-side room identifier, if known.
    pub room_id: Option<String>,
    /// Participants in join order. Never longer than [`MAX_PARTICIPANTS`].
    pub participants: Vec<ParticipantRef>,
    /// `true` when the payload had no usable participant list and this
    /// snapshot was reconstructed from what was previously known.
    pub inferred: bool,
}

impl RoomSnapshot {
    /// Number of participants in the room.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Position of `connection_id` in join order.
    pub fn index_of(&self, connection_id: &str) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.connection_id.as_deref() == Some(connection_id))
    }

    /// Returns `true` once the room is fully populated.
    pub fn is_full(&self) -> bool {
        self.participant_count() >= MAX_PARTICIPANTS
    }
}

/// Owns the current [`RoomSnapshot`].
#[derive(Debug, Default)]
pub struct RoomStateStore {
    current: Option<Arc<RoomSnapshot>>,
}

impl RoomStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored snapshot with one derived from `payload`.
    ///
    /// A payload without a participant list keeps the previously known
    /// participants, or assumes a single participant when nothing is known.
    pub fn apply_room_event(&mut self, payload: &RoomPayload) -> Arc<RoomSnapshot> {
        let previous = self.current.as_deref();
        let room_id = payload
            .room_id
            .clone()
            .or_else(|| previous.and_then(|s| s.room_id.clone()));

        let snapshot = match &payload.players {
            Some(players) => {
                let mut participants = players.clone();
                if participants.len() > MAX_PARTICIPANTS {
                    warn!(
                        "room payload lists {} participants; keeping the first {MAX_PARTICIPANTS}",
                        participants.len()
                    );
                    participants.truncate(MAX_PARTICIPANTS);
                }
                RoomSnapshot {
                    room_id,
                    participants,
                    inferred: false,
                }
            }
            None => {
                let participants = match previous {
                    Some(known) => known.participants.clone(),
                    None => vec![ParticipantRef::anonymous()],
                };
                warn!(
                    "room payload has no participant list; assuming {} known participant(s)",
                    participants.len()
                );
                RoomSnapshot {
                    room_id,
                    participants,
                    inferred: true,
                }
            }
        };

        let snapshot = Arc::new(snapshot);
        self.current = Some(Arc::clone(&snapshot));
        debug!(
            "room snapshot replaced: {} participant(s)",
            snapshot.participant_count()
        );
        snapshot
    }

    /// The current snapshot, if a room is known.
    pub fn current(&self) -> Option<Arc<RoomSnapshot>> {
        self.current.clone()
    }

    /// Forget the current room.
    pub fn clear(&mut self) {
        self.current = None;
    }
}
