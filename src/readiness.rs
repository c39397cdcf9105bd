//! Per-session accumulation of "ready" signals.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::protocol::ConnectionId;
use crate::room::MAX_PARTICIPANTS;

/// Identifiers that have signalled ready in the current session.
pub type ReadinessSet = BTreeSet<ConnectionId>;

/// Owns the [`ReadinessSet`].
#[derive(Debug, Default)]
pub struct ReadinessTracker {
    ready: ReadinessSet,
    declared_complete: bool,
}

impl ReadinessTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `connection_id` as ready. Repeated signals are no-ops.
    pub fn mark_ready(&mut self, connection_id: &str) -> &ReadinessSet {
        if !self.ready.contains(connection_id) {
            if self.ready.len() >= MAX_PARTICIPANTS {
                warn!("ignoring ready signal from {connection_id}: set already holds {MAX_PARTICIPANTS}");
            } else {
                self.ready.insert(connection_id.to_owned());
                debug!("{connection_id} ready ({}/{MAX_PARTICIPANTS})", self.ready.len());
            }
        }
        &self.ready
    }

    /// Record the server's authoritative "everyone is ready" flag.
    pub fn declare_complete(&mut self) {
        self.declared_complete = true;
    }

    /// Returns `true` once `expected` participants are ready or the server said so.
    pub fn is_complete(&self, expected: usize) -> bool {
        self.declared_complete || self.ready.len() >= expected
    }

    /// Current set of ready identifiers.
    pub fn ready(&self) -> &ReadinessSet {
        &self.ready
    }

    /// Forget every signal.
    pub fn reset(&mut self) {
        self.ready.clear();
        self.declared_complete = false;
    }
}
