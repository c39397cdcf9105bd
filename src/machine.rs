//! The session state machine.
//!
//! [`SessionMachine`] is sans-IO: every input (a command from the local
//! user, an inbound event, a timer that elapsed, a reconnect that finished)
//! returns a list of [`Effect`]s for the driver to carry out. Timers are
//! identified by tickets bound to the session that scheduled them, so a timer
//! that outlives its session is recognized and ignored when it fires.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{MatchLinkError, Result};
use crate::error_codes::is_already_in_room;
use crate::event::{HandOff, MatchLinkEvent, StartTrigger};
use crate::identity::{IdentityResolver, Position};
use crate::protocol::{
    ConnectionId, ErrorPayload, InboundEvent, MatchRequest, OutboundCommand, ReadyPayload,
    RoomPayload,
};
use crate::readiness::ReadinessTracker;
use crate::room::{RoomSnapshot, RoomStateStore, MAX_PARTICIPANTS};
use crate::session::{SessionContext, SessionId, SessionPhase, SessionView};

/// Default delay between a full room and the hand-off.
pub const DEFAULT_POPULATION_START_DELAY: Duration = Duration::from_secs(2);

/// Default delay between completed readiness and the hand-off.
pub const DEFAULT_READINESS_START_DELAY: Duration = Duration::from_secs(1);

/// Rooms of ended sessions remembered for discarding late duplicates.
pub const RETIRED_ROOM_CAPACITY: usize = 8;

// ── Configuration ───────────────────────────────────────────────────

/// Bounds the "already in a room" reconnect-and-retry recovery.
///
/// Attempt `n` (1-based) waits `initial_backoff * multiplier^(n-1)`, capped
/// at `max_backoff`, before reconnecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reconnect attempts allowed per session.
    pub max_attempts: u32,
    /// Wait before the first attempt.
    pub initial_backoff: Duration,
    /// Growth factor between attempts.
    pub multiplier: u32,
    /// Upper bound on any single wait.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            multiplier: 2,
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Wait before the given 1-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Timing and retry knobs of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Delay before handing off once the room is full.
    pub population_start_delay: Duration,
    /// Delay before handing off once readiness is complete.
    pub readiness_start_delay: Duration,
    /// Recovery bounds.
    pub retry: RetryPolicy,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            population_start_delay: DEFAULT_POPULATION_START_DELAY,
            readiness_start_delay: DEFAULT_READINESS_START_DELAY,
            retry: RetryPolicy::default(),
        }
    }
}

// ── Effects ─────────────────────────────────────────────────────────

/// Identifies one scheduled hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandOffTicket {
    /// Session that scheduled it.
    pub session: SessionId,
    /// Monotonic sequence number, unique per machine.
    pub seq: u64,
    /// Path that scheduled it.
    pub trigger: StartTrigger,
}

/// Identifies one scheduled reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReconnectTicket {
    /// Session that scheduled it.
    pub session: SessionId,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Side effect requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send a command to the server.
    Send(OutboundCommand),
    /// Arm the hand-off timer, replacing any armed one.
    ScheduleHandOff {
        /// Pass back to [`SessionMachine::hand_off_elapsed`].
        ticket: HandOffTicket,
        /// How long to wait.
        delay: Duration,
    },
    /// Disarm the hand-off timer.
    CancelHandOff,
    /// Arm the reconnect timer; when it elapses, force a fresh connection.
    ScheduleReconnect {
        /// Pass back to [`SessionMachine::reconnect_finished`].
        ticket: ReconnectTicket,
        /// How long to wait.
        delay: Duration,
    },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Deliver an event to consumers.
    Emit(MatchLinkEvent),
}

// ── Machine ─────────────────────────────────────────────────────────

/// Reconciles inbound events into one consistent session.
///
/// Owns the phase, the [`RoomStateStore`] and the [`ReadinessTracker`];
/// nothing else writes them.
#[derive(Debug)]
pub struct SessionMachine {
    config: MachineConfig,
    phase: SessionPhase,
    session: Option<SessionContext>,
    room: RoomStateStore,
    readiness: ReadinessTracker,
    resolver: IdentityResolver,
    connection_id: Option<ConnectionId>,
    connected: bool,
    participant_created: bool,
    pending_hand_off: Option<HandOffTicket>,
    pending_reconnect: Option<ReconnectTicket>,
    retired_rooms: VecDeque<String>,
    next_ticket: u64,
}

impl SessionMachine {
    /// Create an idle machine with the default identity strategies.
    pub fn new(config: MachineConfig) -> Self {
        Self::with_resolver(config, IdentityResolver::default())
    }

    /// Create an idle machine with a custom identity resolver.
    pub fn with_resolver(config: MachineConfig, resolver: IdentityResolver) -> Self {
        Self {
            config,
            phase: SessionPhase::Idle,
            session: None,
            room: RoomStateStore::new(),
            readiness: ReadinessTracker::new(),
            resolver,
            connection_id: None,
            connected: false,
            participant_created: false,
            pending_hand_off: None,
            pending_reconnect: None,
            retired_rooms: VecDeque::with_capacity(RETIRED_ROOM_CAPACITY),
            next_ticket: 0,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Identifier of the live session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Resolved seat in the live session.
    pub fn position(&self) -> Position {
        self.session
            .as_ref()
            .map_or(Position::Unassigned, |s| s.position)
    }

    /// Readiness tracker (read-only).
    pub fn readiness(&self) -> &ReadinessTracker {
        &self.readiness
    }

    /// Build the read-only view for renderers.
    pub fn view(&self) -> SessionView {
        SessionView {
            phase: self.phase,
            session: self.session_id(),
            room: self.room.current(),
            connection_id: self.connection_id.clone(),
            position: self.position(),
            connected: self.connected,
            participant_created: self.participant_created,
        }
    }

    // ── Inputs ──────────────────────────────────────────────────────

    /// Record the transport's connection state and local identifier.
    pub fn set_connection(&mut self, connected: bool, connection_id: Option<ConnectionId>) {
        self.connected = connected;
        self.connection_id = connection_id;
    }

    /// Open a new session and ask the server for a match.
    ///
    /// # Errors
    ///
    /// - [`MatchLinkError::NotConnected`] if the transport is down.
    /// - [`MatchLinkError::ParticipantNotCreated`] before `participant-created`.
    /// - [`MatchLinkError::SessionActive`] if a session is already live.
    pub fn request_match(&mut self, selected_variant: u32) -> Result<(SessionId, Vec<Effect>)> {
        if !self.connected {
            return Err(MatchLinkError::NotConnected);
        }
        if !self.participant_created {
            return Err(MatchLinkError::ParticipantNotCreated);
        }
        if self.phase != SessionPhase::Idle {
            return Err(MatchLinkError::SessionActive { phase: self.phase });
        }

        let request = MatchRequest {
            session_id: SessionId::generate(),
            connection_id: self.connection_id.clone(),
            selected_variant,
        };
        let session = request.session_id;
        debug!("starting session {session} with variant {selected_variant}");

        self.room.clear();
        self.readiness.reset();
        self.session = Some(SessionContext::new(request.clone()));

        let mut effects = Vec::new();
        self.transition(SessionPhase::Matchmaking, &mut effects);
        effects.push(Effect::Send(OutboundCommand::FindMatch(request)));
        Ok((session, effects))
    }

    /// Withdraw the pending match request.
    ///
    /// # Errors
    ///
    /// Returns [`MatchLinkError::InvalidPhase`] outside
    /// [`SessionPhase::Matchmaking`].
    pub fn cancel(&mut self) -> Result<Vec<Effect>> {
        if self.phase != SessionPhase::Matchmaking {
            return Err(MatchLinkError::InvalidPhase {
                operation: "cancel matchmaking",
                phase: self.phase,
            });
        }
        let mut effects = vec![Effect::Send(OutboundCommand::CancelMatchmaking)];
        self.reset_to_idle(&mut effects);
        Ok(effects)
    }

    /// Apply one inbound event.
    pub fn handle(&mut self, event: InboundEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            InboundEvent::ParticipantCreated => {
                self.participant_created = true;
                effects.push(Effect::Emit(MatchLinkEvent::ParticipantCreated));
            }
            InboundEvent::RoomJoined(payload) => self.on_room(payload, true, &mut effects),
            InboundEvent::ParticipantJoinedRoom(payload) => {
                self.on_room(payload, false, &mut effects);
            }
            InboundEvent::ParticipantReady(payload) => self.on_ready(payload, &mut effects),
            InboundEvent::LeftRoom => {
                if self.session.is_some() {
                    debug!("left room; ending session");
                    self.reset_to_idle(&mut effects);
                } else {
                    debug!("left-room with no live session");
                }
            }
            InboundEvent::Error(payload) => self.on_error(payload, &mut effects),
            InboundEvent::Unknown(name) => debug!("ignoring unhandled event {name}"),
        }
        effects
    }

    /// The hand-off timer armed with `ticket` elapsed.
    pub fn hand_off_elapsed(&mut self, ticket: HandOffTicket) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.pending_hand_off != Some(ticket) {
            debug!("discarding stale hand-off timer for session {}", ticket.session);
            return effects;
        }
        self.pending_hand_off = None;

        let Some(context) = self.session.clone() else {
            return effects;
        };
        if self.phase == SessionPhase::BothReady {
            self.transition(SessionPhase::GameStarting, &mut effects);
        }
        if self.phase != SessionPhase::GameStarting {
            warn!("hand-off timer fired while {}; ignoring", self.phase);
            return effects;
        }

        debug!("handing off session {} as {}", context.id, context.position);
        effects.push(Effect::Emit(MatchLinkEvent::HandOff(HandOff {
            session: context.id,
            position: context.position,
            room: self.room.current(),
            selected_variant: context.request.selected_variant,
            trigger: ticket.trigger,
        })));
        self.reset_to_idle(&mut effects);
        effects
    }

    /// The reconnect armed with `ticket` completed.
    ///
    /// `outcome` carries the new local connection identifier on success.
    pub fn reconnect_finished(
        &mut self,
        ticket: ReconnectTicket,
        outcome: Result<Option<ConnectionId>>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.pending_reconnect != Some(ticket) {
            debug!("discarding stale reconnect for session {}", ticket.session);
            return effects;
        }
        self.pending_reconnect = None;

        match outcome {
            Ok(connection_id) => {
                self.set_connection(true, connection_id);
                if self.phase != SessionPhase::Matchmaking {
                    debug!("reconnected while {}; not re-issuing match request", self.phase);
                } else if let Some(context) = &self.session {
                    debug!(
                        "reconnected; re-issuing match request for session {}",
                        context.id
                    );
                    effects.push(Effect::Send(OutboundCommand::FindMatch(
                        context.request.clone(),
                    )));
                }
            }
            Err(e) => {
                warn!("reconnect attempt {} failed: {e}", ticket.attempt);
                self.connected = false;
                self.schedule_reconnect(&mut effects);
            }
        }
        effects
    }

    /// The transport went away.
    pub fn disconnected(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.connected = false;
        self.participant_created = false;
        if self.session.is_some() {
            self.reset_to_idle(&mut effects);
        }
        effects
    }

    // ── Event handlers ──────────────────────────────────────────────

    /// Returns the live session if an event tagged `tag` for `room_id`
    /// belongs to it.
    fn accepting(
        &self,
        tag: Option<SessionId>,
        room_id: Option<&str>,
        event: &str,
    ) -> Option<SessionId> {
        let Some(current) = self.session_id() else {
            debug!("discarding {event}: no live session");
            return None;
        };
        if let Some(tag) = tag.filter(|tag| *tag != current) {
            debug!("discarding {event} for superseded session {tag}");
            return None;
        }
        if let Some(room_id) = room_id.filter(|id| self.retired_rooms.iter().any(|r| r == id)) {
            debug!("discarding {event} for room {room_id} of an ended session");
            return None;
        }
        Some(current)
    }

    fn on_room(&mut self, payload: RoomPayload, first_snapshot: bool, effects: &mut Vec<Effect>) {
        let name = if first_snapshot {
            "room-joined"
        } else {
            "participant-joined-room"
        };
        let Some(session) = self.accepting(payload.session_tag, payload.room_id.as_deref(), name)
        else {
            return;
        };

        let room = self.room.apply_room_event(&payload);
        effects.push(Effect::Emit(MatchLinkEvent::RoomUpdated {
            session,
            room: std::sync::Arc::clone(&room),
        }));
        self.resolve_position(session, &room, effects);

        match self.phase {
            SessionPhase::Matchmaking => {
                if self.pending_reconnect.take().is_some() {
                    debug!("{name} during recovery; abandoning reconnect");
                    effects.push(Effect::CancelReconnect);
                }
                if first_snapshot {
                    self.readiness.reset();
                }
                self.transition(SessionPhase::RoomJoined, effects);
                self.evaluate_population(&room, effects);
            }
            SessionPhase::RoomJoined | SessionPhase::WaitingForPlayers => {
                self.evaluate_population(&room, effects);
            }
            SessionPhase::BothReady | SessionPhase::GameStarting => {
                debug!("{name} while {}; start already scheduled", self.phase);
            }
            SessionPhase::Idle => {}
        }
    }

    fn on_ready(&mut self, payload: ReadyPayload, effects: &mut Vec<Effect>) {
        let Some(session) = self.accepting(
            payload.session_tag,
            payload.room_id.as_deref(),
            "participant-ready",
        ) else {
            return;
        };
        match self.phase {
            SessionPhase::Matchmaking => {
                debug!("discarding participant-ready before any room snapshot");
                return;
            }
            SessionPhase::GameStarting => {
                debug!("participant-ready while game starting; ignored");
                return;
            }
            _ => {}
        }

        if let Some(id) = &payload.connection_id {
            let before = self.readiness.ready().len();
            let ready = self.readiness.mark_ready(id);
            if ready.len() != before {
                effects.push(Effect::Emit(MatchLinkEvent::ReadinessChanged {
                    session,
                    ready: ready.clone(),
                }));
            }
        } else if !payload.all_ready {
            warn!("participant-ready without an identifier");
        }
        if payload.all_ready {
            self.readiness.declare_complete();
        }

        if self.readiness.is_complete(MAX_PARTICIPANTS) {
            debug!("readiness complete for session {session}");
            self.transition(SessionPhase::BothReady, effects);
            self.transition(SessionPhase::GameStarting, effects);
            self.schedule_hand_off(StartTrigger::Readiness, effects);
        }
    }

    fn on_error(&mut self, payload: ErrorPayload, effects: &mut Vec<Effect>) {
        let recoverable = is_already_in_room(payload.code.as_ref(), &payload.message);
        if recoverable && self.phase == SessionPhase::Matchmaking {
            if self.pending_reconnect.is_some() {
                debug!("already-in-room recovery in progress; ignoring repeat");
                return;
            }
            self.schedule_reconnect(effects);
            return;
        }

        warn!(
            "server error ({}): {}",
            payload.kind.as_deref().unwrap_or("untyped"),
            payload.message
        );
        effects.push(Effect::Emit(MatchLinkEvent::ServerError {
            kind: payload.kind,
            message: payload.message,
        }));
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn resolve_position(
        &mut self,
        session: SessionId,
        room: &RoomSnapshot,
        effects: &mut Vec<Effect>,
    ) {
        let Some(context) = self.session.as_mut() else {
            return;
        };
        let position = self
            .resolver
            .resolve(room, self.connection_id.as_deref(), context.position);
        if position != context.position {
            context.position = position;
            effects.push(Effect::Emit(MatchLinkEvent::PositionResolved {
                session,
                position,
            }));
        }
    }

    fn evaluate_population(&mut self, room: &RoomSnapshot, effects: &mut Vec<Effect>) {
        if room.is_full() {
            self.transition(SessionPhase::BothReady, effects);
            self.schedule_hand_off(StartTrigger::Population, effects);
        } else {
            self.transition(SessionPhase::WaitingForPlayers, effects);
        }
    }

    fn schedule_hand_off(&mut self, trigger: StartTrigger, effects: &mut Vec<Effect>) {
        let Some(session) = self.session_id() else {
            return;
        };
        self.next_ticket += 1;
        let ticket = HandOffTicket {
            session,
            seq: self.next_ticket,
            trigger,
        };
        let delay = match trigger {
            StartTrigger::Population => self.config.population_start_delay,
            StartTrigger::Readiness => self.config.readiness_start_delay,
        };
        self.pending_hand_off = Some(ticket);
        effects.push(Effect::ScheduleHandOff { ticket, delay });
    }

    fn schedule_reconnect(&mut self, effects: &mut Vec<Effect>) {
        let Some(context) = self.session.as_mut() else {
            return;
        };
        context.retry_attempts += 1;
        let attempt = context.retry_attempts;
        let session = context.id;

        if attempt > self.config.retry.max_attempts {
            let error = MatchLinkError::RetryExhausted {
                attempts: attempt - 1,
            };
            warn!("session {session}: {error}");
            effects.push(Effect::Emit(MatchLinkEvent::MatchmakingFailed {
                session,
                reason: error.to_string(),
            }));
            self.reset_to_idle(effects);
            return;
        }

        let ticket = ReconnectTicket { session, attempt };
        self.pending_reconnect = Some(ticket);
        effects.push(Effect::Emit(MatchLinkEvent::RecoveryStarted { session, attempt }));
        effects.push(Effect::ScheduleReconnect {
            ticket,
            delay: self.config.retry.backoff(attempt),
        });
    }

    fn transition(&mut self, to: SessionPhase, effects: &mut Vec<Effect>) {
        let from = self.phase;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!("rejected phase transition {from} -> {to}");
            return;
        }
        debug!("phase {from} -> {to}");
        self.phase = to;
        effects.push(Effect::Emit(MatchLinkEvent::PhaseChanged {
            session: self.session_id(),
            from,
            to,
        }));
    }

    fn retire_current_room(&mut self) {
        let Some(room_id) = self.room.current().and_then(|r| r.room_id.clone()) else {
            return;
        };
        if self.retired_rooms.contains(&room_id) {
            return;
        }
        if self.retired_rooms.len() == RETIRED_ROOM_CAPACITY {
            self.retired_rooms.pop_front();
        }
        debug!("retiring room {room_id}");
        self.retired_rooms.push_back(room_id);
    }

    fn reset_to_idle(&mut self, effects: &mut Vec<Effect>) {
        if self.phase.in_room() {
            self.retire_current_room();
        }
        if self.pending_hand_off.take().is_some() {
            effects.push(Effect::CancelHandOff);
        }
        if self.pending_reconnect.take().is_some() {
            effects.push(Effect::CancelReconnect);
        }
        self.transition(SessionPhase::Idle, effects);
        self.session = None;
        self.room.clear();
        self.readiness.reset();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error_codes::ErrorCode;

    fn machine_for(local: &str) -> SessionMachine {
        let mut machine = SessionMachine::new(MachineConfig::default());
        machine.set_connection(true, Some(local.to_owned()));
        machine.handle(InboundEvent::ParticipantCreated);
        machine
    }

    fn room_joined(ids: &[&str]) -> InboundEvent {
        InboundEvent::RoomJoined(RoomPayload::with_players(ids.iter().copied()))
    }

    fn ready(id: &str) -> InboundEvent {
        InboundEvent::ParticipantReady(ReadyPayload::from_participant(id))
    }

    fn phases(effects: &[Effect]) -> Vec<SessionPhase> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(MatchLinkEvent::PhaseChanged { to, .. }) => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn hand_off_ticket(effects: &[Effect]) -> Option<(HandOffTicket, Duration)> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleHandOff { ticket, delay } => Some((*ticket, *delay)),
            _ => None,
        })
    }

    fn hand_offs(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Emit(MatchLinkEvent::HandOff(_))))
            .count()
    }

    #[test]
    fn request_is_gated_on_connection_and_participant() {
        let mut machine = SessionMachine::new(MachineConfig::default());
        assert!(matches!(
            machine.request_match(0),
            Err(MatchLinkError::NotConnected)
        ));
        machine.set_connection(true, Some("A".into()));
        assert!(matches!(
            machine.request_match(0),
            Err(MatchLinkError::ParticipantNotCreated)
        ));
        machine.handle(InboundEvent::ParticipantCreated);
        assert!(machine.request_match(0).is_ok());
        assert!(matches!(
            machine.request_match(0),
            Err(MatchLinkError::SessionActive {
                phase: SessionPhase::Matchmaking
            })
        ));
    }

    #[test]
    fn request_sends_find_match() {
        let mut machine = machine_for("A");
        let (session, effects) = machine.request_match(3).unwrap();
        assert_eq!(machine.phase(), SessionPhase::Matchmaking);
        assert!(effects.contains(&Effect::Send(OutboundCommand::FindMatch(MatchRequest {
            session_id: session,
            connection_id: Some("A".into()),
            selected_variant: 3,
        }))));
    }

    #[test]
    fn lone_participant_waits_as_player_one() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        let effects = machine.handle(room_joined(&["A"]));

        assert_eq!(machine.position(), Position::Player1);
        assert_eq!(machine.phase(), SessionPhase::WaitingForPlayers);
        assert_eq!(
            phases(&effects),
            vec![SessionPhase::RoomJoined, SessionPhase::WaitingForPlayers]
        );
        assert!(hand_off_ticket(&effects).is_none());
    }

    #[test]
    fn full_room_starts_after_population_delay() {
        let mut machine = machine_for("B");
        machine.request_match(0).unwrap();
        let effects = machine.handle(room_joined(&["A", "B"]));

        assert_eq!(machine.position(), Position::Player2);
        assert_eq!(
            phases(&effects),
            vec![SessionPhase::RoomJoined, SessionPhase::BothReady]
        );
        let (ticket, delay) = hand_off_ticket(&effects).unwrap();
        assert_eq!(delay, DEFAULT_POPULATION_START_DELAY);
        assert_eq!(ticket.trigger, StartTrigger::Population);

        let effects = machine.hand_off_elapsed(ticket);
        assert_eq!(hand_offs(&effects), 1);
        assert_eq!(
            phases(&effects),
            vec![SessionPhase::GameStarting, SessionPhase::Idle]
        );
        assert_eq!(machine.view(), SessionView {
            connected: true,
            participant_created: true,
            connection_id: Some("B".into()),
            ..SessionView::default()
        });

        // A second firing of the same ticket does nothing.
        assert!(machine.hand_off_elapsed(ticket).is_empty());
    }

    #[test]
    fn duplicate_room_joined_does_not_retrigger() {
        let mut machine = machine_for("B");
        machine.request_match(0).unwrap();
        let first = machine.handle(room_joined(&["A", "B"]));
        let snapshot = machine.view().room.unwrap();
        let second = machine.handle(room_joined(&["A", "B"]));

        assert!(hand_off_ticket(&first).is_some());
        assert!(hand_off_ticket(&second).is_none());
        assert!(phases(&second).is_empty());
        assert_eq!(*machine.view().room.unwrap(), *snapshot);
    }

    #[test]
    fn second_participant_joining_completes_population() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        machine.handle(room_joined(&["A"]));
        let effects = machine.handle(InboundEvent::ParticipantJoinedRoom(
            RoomPayload::with_players(["A", "B"]),
        ));
        assert_eq!(phases(&effects), vec![SessionPhase::BothReady]);
        assert_eq!(machine.position(), Position::Player1);
    }

    #[test]
    fn fallback_position_is_kept_when_snapshot_disagrees() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        // Delivered before our own join is reflected: count fallback says Player1.
        machine.handle(room_joined(&["B"]));
        assert_eq!(machine.position(), Position::Player1);
        machine.handle(InboundEvent::ParticipantJoinedRoom(
            RoomPayload::with_players(["B", "A"]),
        ));
        assert_eq!(machine.position(), Position::Player1);
    }

    #[test]
    fn readiness_starts_after_readiness_delay() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        machine.handle(room_joined(&["A"]));
        machine.handle(ready("A"));
        let effects = machine.handle(ready("B"));

        assert_eq!(
            phases(&effects),
            vec![SessionPhase::BothReady, SessionPhase::GameStarting]
        );
        let (ticket, delay) = hand_off_ticket(&effects).unwrap();
        assert_eq!(delay, DEFAULT_READINESS_START_DELAY);
        assert_eq!(hand_offs(&machine.hand_off_elapsed(ticket)), 1);
        assert_eq!(machine.phase(), SessionPhase::Idle);
    }

    #[test]
    fn all_ready_flag_completes_readiness() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        machine.handle(room_joined(&["A"]));
        let effects = machine.handle(InboundEvent::ParticipantReady(ReadyPayload {
            connection_id: Some("A".into()),
            all_ready: true,
            room_id: None,
            session_tag: None,
        }));
        assert_eq!(machine.phase(), SessionPhase::GameStarting);
        assert!(hand_off_ticket(&effects).is_some());
    }

    #[test]
    fn duplicate_ready_is_idempotent() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        machine.handle(room_joined(&["A"]));
        machine.handle(ready("A"));
        let effects = machine.handle(ready("A"));
        assert_eq!(machine.readiness().ready().len(), 1);
        assert!(effects.is_empty());
        assert_eq!(machine.phase(), SessionPhase::WaitingForPlayers);
    }

    #[test]
    fn readiness_supersedes_population_timer() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        let population = hand_off_ticket(&machine.handle(room_joined(&["A", "B"])))
            .unwrap()
            .0;
        machine.handle(ready("A"));
        let readiness = hand_off_ticket(&machine.handle(ready("B"))).unwrap().0;

        assert!(machine.hand_off_elapsed(population).is_empty());
        assert_eq!(machine.phase(), SessionPhase::GameStarting);
        assert_eq!(hand_offs(&machine.hand_off_elapsed(readiness)), 1);
    }

    #[test]
    fn cancel_discards_late_room_event() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        let effects = machine.cancel().unwrap();
        assert_eq!(effects[0], Effect::Send(OutboundCommand::CancelMatchmaking));
        assert_eq!(machine.phase(), SessionPhase::Idle);

        let effects = machine.handle(room_joined(&["A", "B"]));
        assert!(effects.is_empty());
        assert_eq!(machine.phase(), SessionPhase::Idle);
        assert!(machine.view().room.is_none());
    }

    #[test]
    fn cancel_outside_matchmaking_is_rejected() {
        let mut machine = machine_for("A");
        assert!(matches!(
            machine.cancel(),
            Err(MatchLinkError::InvalidPhase {
                phase: SessionPhase::Idle,
                ..
            })
        ));
        machine.request_match(0).unwrap();
        machine.handle(room_joined(&["A"]));
        assert!(machine.cancel().is_err());
    }

    #[test]
    fn superseded_session_tag_is_discarded() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        let mut payload = RoomPayload::with_players(["A"]);
        payload.session_tag = Some(SessionId::generate());
        assert!(machine.handle(InboundEvent::RoomJoined(payload)).is_empty());
        assert_eq!(machine.phase(), SessionPhase::Matchmaking);
    }

    #[test]
    fn left_room_cancels_pending_hand_off() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        let ticket = hand_off_ticket(&machine.handle(room_joined(&["A", "B"])))
            .unwrap()
            .0;
        let effects = machine.handle(InboundEvent::LeftRoom);
        assert!(effects.contains(&Effect::CancelHandOff));
        assert_eq!(machine.phase(), SessionPhase::Idle);
        assert!(machine.hand_off_elapsed(ticket).is_empty());
    }

    #[test]
    fn already_in_room_schedules_reconnect_and_retries_same_request() {
        let mut machine = machine_for("A");
        let (_, effects) = machine.request_match(5).unwrap();
        let original = effects
            .iter()
            .find_map(|e| match e {
                Effect::Send(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .unwrap();

        let effects = machine.handle(InboundEvent::Error(ErrorPayload {
            kind: Some("GAME_ERROR".into()),
            message: "Player already in a room".into(),
            code: None,
        }));
        let ticket = effects
            .iter()
            .find_map(|e| match e {
                Effect::ScheduleReconnect { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .unwrap();
        assert_eq!(ticket.attempt, 1);
        assert_eq!(machine.phase(), SessionPhase::Matchmaking);

        let effects = machine.reconnect_finished(ticket, Ok(Some("A2".into())));
        assert_eq!(effects, vec![Effect::Send(original)]);
        assert_eq!(machine.phase(), SessionPhase::Matchmaking);
        assert_eq!(machine.view().connection_id.as_deref(), Some("A2"));
    }

    #[test]
    fn room_joined_during_recovery_abandons_reconnect() {
        let mut machine = machine_for("A");
        machine.request_match(5).unwrap();
        let effects = machine.handle(InboundEvent::Error(ErrorPayload {
            kind: Some("GAME_ERROR".into()),
            message: "Player already in a room".into(),
            code: None,
        }));
        let ticket = effects
            .iter()
            .find_map(|e| match e {
                Effect::ScheduleReconnect { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .unwrap();

        let effects = machine.handle(room_joined(&["A"]));
        assert!(effects.contains(&Effect::CancelReconnect));
        assert_eq!(machine.phase(), SessionPhase::WaitingForPlayers);

        let effects = machine.reconnect_finished(ticket, Ok(Some("A2".into())));
        assert!(effects.is_empty());
        assert_eq!(machine.phase(), SessionPhase::WaitingForPlayers);
        assert_eq!(machine.view().connection_id.as_deref(), Some("A"));
    }

    #[test]
    fn room_of_finished_session_is_ignored_by_next_session() {
        let mut machine = machine_for("A");
        let mut payload = RoomPayload::with_players(["A", "B"]);
        payload.room_id = Some("r1".into());

        machine.request_match(0).unwrap();
        let ticket = hand_off_ticket(&machine.handle(InboundEvent::RoomJoined(payload.clone())))
            .unwrap()
            .0;
        assert_eq!(hand_offs(&machine.hand_off_elapsed(ticket)), 1);

        machine.request_match(0).unwrap();
        let effects = machine.handle(InboundEvent::RoomJoined(payload));
        assert!(effects.is_empty());
        assert_eq!(machine.phase(), SessionPhase::Matchmaking);

        let mut late_ready = ReadyPayload::from_participant("B");
        late_ready.room_id = Some("r1".into());
        assert!(machine
            .handle(InboundEvent::ParticipantReady(late_ready))
            .is_empty());

        let mut fresh = RoomPayload::with_players(["A"]);
        fresh.room_id = Some("r2".into());
        machine.handle(InboundEvent::RoomJoined(fresh));
        assert_eq!(machine.phase(), SessionPhase::WaitingForPlayers);
    }

    #[test]
    fn left_rooms_are_retired_with_bounded_memory() {
        let mut machine = machine_for("A");
        for n in 0..=RETIRED_ROOM_CAPACITY {
            machine.request_match(0).unwrap();
            let mut payload = RoomPayload::with_players(["A"]);
            payload.room_id = Some(format!("room-{n}"));
            machine.handle(InboundEvent::RoomJoined(payload));
            machine.handle(InboundEvent::LeftRoom);
        }
        assert_eq!(machine.retired_rooms.len(), RETIRED_ROOM_CAPACITY);

        // The oldest room has been forgotten; the newest is still refused.
        machine.request_match(0).unwrap();
        let mut newest = RoomPayload::with_players(["A"]);
        newest.room_id = Some(format!("room-{RETIRED_ROOM_CAPACITY}"));
        assert!(machine.handle(InboundEvent::RoomJoined(newest)).is_empty());
        let mut oldest = RoomPayload::with_players(["A"]);
        oldest.room_id = Some("room-0".into());
        machine.handle(InboundEvent::RoomJoined(oldest));
        assert_eq!(machine.phase(), SessionPhase::WaitingForPlayers);
    }

    #[test]
    fn recovery_gives_up_after_max_attempts() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        let conflict = || {
            InboundEvent::Error(ErrorPayload {
                kind: None,
                message: String::new(),
                code: Some(ErrorCode::AlreadyInRoom),
            })
        };

        for attempt in 1..=RetryPolicy::default().max_attempts {
            let effects = machine.handle(conflict());
            let ticket = effects
                .iter()
                .find_map(|e| match e {
                    Effect::ScheduleReconnect { ticket, .. } => Some(*ticket),
                    _ => None,
                })
                .unwrap();
            assert_eq!(ticket.attempt, attempt);
            machine.reconnect_finished(ticket, Ok(Some("A".into())));
        }

        let effects = machine.handle(conflict());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Emit(MatchLinkEvent::MatchmakingFailed { .. }))));
        assert_eq!(machine.phase(), SessionPhase::Idle);
    }

    #[test]
    fn unrelated_error_is_surfaced() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        let effects = machine.handle(InboundEvent::Error(ErrorPayload {
            kind: Some("GAME_ERROR".into()),
            message: "Room is full".into(),
            code: None,
        }));
        assert_eq!(
            effects,
            vec![Effect::Emit(MatchLinkEvent::ServerError {
                kind: Some("GAME_ERROR".into()),
                message: "Room is full".into(),
            })]
        );
        assert_eq!(machine.phase(), SessionPhase::Matchmaking);
    }

    #[test]
    fn disconnect_resets_session_and_participant_gate() {
        let mut machine = machine_for("A");
        machine.request_match(0).unwrap();
        machine.handle(room_joined(&["A"]));
        machine.disconnected();
        let view = machine.view();
        assert_eq!(view.phase, SessionPhase::Idle);
        assert!(!view.connected);
        assert!(!view.participant_created);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_secs(1));
        assert_eq!(policy.backoff(30), Duration::from_secs(4));
    }
}
