//! Resolution of the local participant's seat in the room.
//!
//! Resolution is a ranked list of [`PositionStrategy`]s tried in order; the
//! first one that answers wins. A position that is already resolved for the
//! session is returned unchanged, whatever later snapshots suggest.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::room::RoomSnapshot;

/// Seat of the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    /// First seat (joined the room first).
    Player1,
    /// Second seat.
    Player2,
    /// Not yet known.
    #[default]
    Unassigned,
}

impl Position {
    /// Returns `true` for [`Player1`](Self::Player1) and [`Player2`](Self::Player2).
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Unassigned)
    }

    /// Seat for a zero-based join-order index.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Player1),
            1 => Some(Self::Player2),
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Player1 => "player1",
            Self::Player2 => "player2",
            Self::Unassigned => "unassigned",
        };
        f.write_str(name)
    }
}

/// One way of deriving a seat from a room snapshot.
pub trait PositionStrategy: fmt::Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns a seat, or `None` if this strategy cannot decide.
    fn resolve(&self, snapshot: &RoomSnapshot, local_connection_id: Option<&str>)
        -> Option<Position>;
}

/// Finds the local identifier in the participant list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl PositionStrategy for ExactMatch {
    fn name(&self) -> &'static str {
        "exact-match"
    }

    fn resolve(
        &self,
        snapshot: &RoomSnapshot,
        local_connection_id: Option<&str>,
    ) -> Option<Position> {
        let local = local_connection_id?;
        snapshot.index_of(local).and_then(Position::from_index)
    }
}

/// Guesses from the participant count: alone means first, otherwise second.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinOrderCount;

impl PositionStrategy for JoinOrderCount {
    fn name(&self) -> &'static str {
        "join-order-count"
    }

    fn resolve(&self, snapshot: &RoomSnapshot, _local: Option<&str>) -> Option<Position> {
        if snapshot.participant_count() == 1 {
            Some(Position::Player1)
        } else {
            Some(Position::Player2)
        }
    }
}

/// Ranked list of [`PositionStrategy`]s.
#[derive(Debug)]
pub struct IdentityResolver {
    strategies: Vec<Box<dyn PositionStrategy>>,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(vec![Box::new(ExactMatch), Box::new(JoinOrderCount)])
    }
}

impl IdentityResolver {
    /// Create a resolver that tries `strategies` in order.
    pub fn new(strategies: Vec<Box<dyn PositionStrategy>>) -> Self {
        Self { strategies }
    }

    /// Resolve the local seat.
    ///
    /// `previous` is the seat already held in this session; once resolved it
    /// is returned as is.
    pub fn resolve(
        &self,
        snapshot: &RoomSnapshot,
        local_connection_id: Option<&str>,
        previous: Position,
    ) -> Position {
        if previous.is_resolved() {
            return previous;
        }
        for strategy in &self.strategies {
            if let Some(position) = strategy.resolve(snapshot, local_connection_id) {
                debug!("position {position} resolved by {}", strategy.name());
                return position;
            }
        }
        Position::Unassigned
    }
}
