#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration tests for the matchlink client.
//!
//! Uses the shared `MockTransport` from `tests/common` to play the server
//! side and verifies what `MatchLinkClient` sends, which events it emits and
//! when. Timer-driven scenarios run on a paused clock.

mod common;

use std::time::Duration;

use matchlink_client::room::RoomSnapshot;
use matchlink_client::{
    IdentityResolver, MatchLinkClient, MatchLinkConfig, MatchLinkError, MatchLinkEvent, Position,
    PositionStrategy, SessionPhase, StartTrigger,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

use common::{
    all_ready_json, error_json, left_room_json, participant_created_json,
    participant_joined_json, ready_json, reconnected_id, room_joined_in, room_joined_json,
    MockServer, MockTransport,
};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

const WAIT: Duration = Duration::from_secs(60);

/// Start a client for `local`, wait for `Connected`, and register the
/// participant so matchmaking can begin.
async fn start_ready(
    local: &str,
    config: MatchLinkConfig,
) -> (MatchLinkClient, mpsc::Receiver<MatchLinkEvent>, MockServer) {
    let (transport, server) = MockTransport::new(local);
    let (client, mut events) = MatchLinkClient::start(transport, config);
    assert_eq!(next_event(&mut events).await, MatchLinkEvent::Connected);

    server.push(participant_created_json());
    wait_for(&mut events, |e| matches!(e, MatchLinkEvent::ParticipantCreated)).await;
    (client, events, server)
}

async fn next_event(events: &mut mpsc::Receiver<MatchLinkEvent>) -> MatchLinkEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip events until one matches `pred`.
async fn wait_for(
    events: &mut mpsc::Receiver<MatchLinkEvent>,
    pred: impl Fn(&MatchLinkEvent) -> bool,
) -> MatchLinkEvent {
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Everything currently queued on the channel.
fn drain(events: &mut mpsc::Receiver<MatchLinkEvent>) -> Vec<MatchLinkEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn hand_offs(events: &[MatchLinkEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, MatchLinkEvent::HandOff(_)))
        .count()
}

async fn wait_for_phase(client: &MatchLinkClient, phase: SessionPhase) {
    let mut watch = client.watch();
    tokio::time::timeout(WAIT, watch.wait_for(|v| v.phase == phase))
        .await
        .expect("timed out waiting for phase")
        .expect("view channel closed");
}

// ════════════════════════════════════════════════════════════════════
// Gating
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn request_before_participant_created_is_rejected() {
    let (transport, server) = MockTransport::new("A");
    let (client, mut events) = MatchLinkClient::start(transport, MatchLinkConfig::new());
    assert_eq!(next_event(&mut events).await, MatchLinkEvent::Connected);

    let err = client.request_match(0).await.unwrap_err();
    assert!(matches!(err, MatchLinkError::ParticipantNotCreated));
    assert!(server.sent().is_empty());
}

#[tokio::test]
async fn second_request_while_matchmaking_is_rejected() {
    let (client, _events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();

    let err = client.request_match(1).await.unwrap_err();
    assert!(matches!(
        err,
        MatchLinkError::SessionActive {
            phase: SessionPhase::Matchmaking
        }
    ));
    assert_eq!(server.sent_events(), vec!["find-match"]);
}

#[tokio::test]
async fn find_match_carries_session_connection_and_variant() {
    let (client, _events, server) = start_ready("A", MatchLinkConfig::new()).await;
    let session = client.request_match(4).await.unwrap();

    let sent = server.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["event"], "find-match");
    assert_eq!(sent[0]["data"]["sessionId"], session.to_string());
    assert_eq!(sent[0]["data"]["connectionId"], "A");
    assert_eq!(sent[0]["data"]["selectedVariant"], 4);
    assert_eq!(client.view().phase, SessionPhase::Matchmaking);
    assert_eq!(client.view().session, Some(session));
}

#[tokio::test]
async fn cancel_outside_matchmaking_is_rejected() {
    let (client, _events, _server) = start_ready("A", MatchLinkConfig::new()).await;
    let err = client.cancel_match().await.unwrap_err();
    assert!(matches!(
        err,
        MatchLinkError::InvalidPhase {
            phase: SessionPhase::Idle,
            ..
        }
    ));
}

// ════════════════════════════════════════════════════════════════════
// Population and readiness
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn lone_participant_waits_without_hand_off() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();

    server.push(room_joined_json(&["A"]));
    let resolved = wait_for(&mut events, |e| {
        matches!(e, MatchLinkEvent::PositionResolved { .. })
    })
    .await;
    assert!(matches!(
        resolved,
        MatchLinkEvent::PositionResolved {
            position: Position::Player1,
            ..
        }
    ));
    wait_for_phase(&client, SessionPhase::WaitingForPlayers).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(hand_offs(&drain(&mut events)), 0);
    let view = client.view();
    assert_eq!(view.phase, SessionPhase::WaitingForPlayers);
    assert_eq!(view.position, Position::Player1);
    assert_eq!(view.participants_in_room(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_room_hands_off_after_population_delay() {
    let (client, mut events, server) = start_ready("B", MatchLinkConfig::new()).await;
    let session = client.request_match(2).await.unwrap();

    let started = Instant::now();
    server.push(room_joined_json(&["A", "B"]));
    let event = wait_for(&mut events, |e| matches!(e, MatchLinkEvent::HandOff(_))).await;
    let MatchLinkEvent::HandOff(hand_off) = event else {
        unreachable!()
    };

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(hand_off.session, session);
    assert_eq!(hand_off.position, Position::Player2);
    assert_eq!(hand_off.selected_variant, 2);
    assert_eq!(hand_off.trigger, StartTrigger::Population);
    assert_eq!(hand_off.room.unwrap().participant_count(), 2);

    wait_for_phase(&client, SessionPhase::Idle).await;
    let view = client.view();
    assert!(view.session.is_none());
    assert!(view.room.is_none());
    assert_eq!(view.position, Position::Unassigned);
}

#[tokio::test(start_paused = true)]
async fn second_participant_joining_hands_off() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();

    server.push(room_joined_json(&["A"]));
    server.push(participant_joined_json(&["A", "B"]));
    let event = wait_for(&mut events, |e| matches!(e, MatchLinkEvent::HandOff(_))).await;
    let MatchLinkEvent::HandOff(hand_off) = event else {
        unreachable!()
    };
    assert_eq!(hand_off.position, Position::Player1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_room_joined_hands_off_once() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();

    let started = Instant::now();
    server.push(room_joined_json(&["A", "B"]));
    tokio::time::sleep(Duration::from_millis(500)).await;
    server.push(room_joined_json(&["A", "B"]));

    wait_for(&mut events, |e| matches!(e, MatchLinkEvent::HandOff(_))).await;
    // The duplicate did not push the start back.
    assert!(started.elapsed() < Duration::from_millis(2500));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(hand_offs(&drain(&mut events)), 0);
}

#[tokio::test(start_paused = true)]
async fn both_ready_hands_off_after_readiness_delay() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();

    server.push(room_joined_json(&["A"]));
    server.push(ready_json("A"));
    server.push(ready_json("A"));
    server.push(ready_json("B"));
    wait_for_phase(&client, SessionPhase::GameStarting).await;

    let started = Instant::now();
    let event = wait_for(&mut events, |e| matches!(e, MatchLinkEvent::HandOff(_))).await;
    let MatchLinkEvent::HandOff(hand_off) = event else {
        unreachable!()
    };
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(hand_off.trigger, StartTrigger::Readiness);
}

#[tokio::test(start_paused = true)]
async fn authoritative_all_ready_flag_starts_game() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();

    server.push(room_joined_json(&["A"]));
    server.push(all_ready_json());
    let event = wait_for(&mut events, |e| matches!(e, MatchLinkEvent::HandOff(_))).await;
    assert!(matches!(
        event,
        MatchLinkEvent::HandOff(hand_off) if hand_off.trigger == StartTrigger::Readiness
    ));
}

#[tokio::test(start_paused = true)]
async fn ready_before_room_is_discarded() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();

    server.push(ready_json("A"));
    server.push(ready_json("B"));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let drained = drain(&mut events);
    assert!(!drained
        .iter()
        .any(|e| matches!(e, MatchLinkEvent::ReadinessChanged { .. })));
    assert_eq!(client.view().phase, SessionPhase::Matchmaking);
}

// ════════════════════════════════════════════════════════════════════
// Cancellation and stale events
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn cancel_discards_late_room_event() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();
    client.cancel_match().await.unwrap();
    assert_eq!(server.sent_events(), vec!["find-match", "cancel-matchmaking"]);

    server.push(room_joined_json(&["A", "B"]));
    tokio::time::sleep(Duration::from_secs(10)).await;

    let drained = drain(&mut events);
    assert_eq!(hand_offs(&drained), 0);
    assert!(!drained
        .iter()
        .any(|e| matches!(e, MatchLinkEvent::RoomUpdated { .. })));
    let view = client.view();
    assert_eq!(view.phase, SessionPhase::Idle);
    assert!(view.room.is_none());
}

#[tokio::test(start_paused = true)]
async fn left_room_cancels_pending_hand_off() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();

    server.push(room_joined_json(&["A", "B"]));
    wait_for_phase(&client, SessionPhase::BothReady).await;
    server.push(left_room_json());
    wait_for_phase(&client, SessionPhase::Idle).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(hand_offs(&drain(&mut events)), 0);
}

#[tokio::test(start_paused = true)]
async fn new_session_after_cancel_is_not_started_by_old_timer() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();
    server.push(room_joined_json(&["A", "B"]));
    wait_for_phase(&client, SessionPhase::BothReady).await;
    server.push(left_room_json());
    wait_for_phase(&client, SessionPhase::Idle).await;

    let second = client.request_match(1).await.unwrap();
    server.push(room_joined_in("room-2", &["A"]));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(hand_offs(&drain(&mut events)), 0);
    let view = client.view();
    assert_eq!(view.session, Some(second));
    assert_eq!(view.phase, SessionPhase::WaitingForPlayers);
}

#[tokio::test(start_paused = true)]
async fn late_duplicate_from_handed_off_room_is_ignored() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();
    server.push(room_joined_json(&["A", "B"]));
    wait_for(&mut events, |e| matches!(e, MatchLinkEvent::HandOff(_))).await;
    wait_for_phase(&client, SessionPhase::Idle).await;

    let second = client.request_match(1).await.unwrap();
    server.push(room_joined_json(&["A", "B"]));
    server.push(ready_json("B"));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(hand_offs(&drain(&mut events)), 0);
    let view = client.view();
    assert_eq!(view.session, Some(second));
    assert_eq!(view.phase, SessionPhase::Matchmaking);
    assert!(view.room.is_none());

    server.push(room_joined_in("room-2", &["A"]));
    wait_for_phase(&client, SessionPhase::WaitingForPlayers).await;
}

// ════════════════════════════════════════════════════════════════════
// "Already in a room" recovery
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn already_in_room_reconnects_and_retries_original_request() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(7).await.unwrap();

    server.push(error_json("GAME_ERROR", "Player already in a room"));
    let event = wait_for(&mut events, |e| {
        matches!(e, MatchLinkEvent::RecoveryStarted { .. })
    })
    .await;
    assert!(matches!(
        event,
        MatchLinkEvent::RecoveryStarted { attempt: 1, .. }
    ));

    let new_id = reconnected_id("A", 1);
    let mut watch = client.watch();
    tokio::time::timeout(
        WAIT,
        watch.wait_for(|v| v.connection_id.as_deref() == Some(new_id.as_str())),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(server.reconnects(), 1);
    let sent = server.sent();
    assert_eq!(server.sent_events(), vec!["find-match", "find-match"]);
    assert_eq!(sent[0]["data"], sent[1]["data"]);
    assert_eq!(client.view().phase, SessionPhase::Matchmaking);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, MatchLinkEvent::PhaseChanged { .. })));

    // Identity follows the fresh connection identifier.
    server.push(room_joined_json(&["X", &new_id]));
    wait_for_phase(&client, SessionPhase::BothReady).await;
    assert_eq!(client.view().position, Position::Player2);
}

#[tokio::test(start_paused = true)]
async fn room_joined_during_back_off_keeps_connection() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(3).await.unwrap();

    server.push(error_json("GAME_ERROR", "Player already in a room"));
    wait_for(&mut events, |e| {
        matches!(e, MatchLinkEvent::RecoveryStarted { .. })
    })
    .await;
    server.push(room_joined_json(&["A"]));
    wait_for_phase(&client, SessionPhase::WaitingForPlayers).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(server.reconnects(), 0);
    assert_eq!(server.sent_events(), vec!["find-match"]);
    let view = client.view();
    assert_eq!(view.phase, SessionPhase::WaitingForPlayers);
    assert_eq!(view.connection_id.as_deref(), Some("A"));
}

#[tokio::test(start_paused = true)]
async fn recovery_gives_up_after_retry_bound() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();
    server.refuse_reconnects(10);

    server.push(error_json("GAME_ERROR", "Player already in a room"));
    let failed = wait_for(&mut events, |e| {
        matches!(e, MatchLinkEvent::MatchmakingFailed { .. })
    })
    .await;
    assert!(matches!(failed, MatchLinkEvent::MatchmakingFailed { .. }));
    assert_eq!(server.reconnects(), 3);

    // The transport never came back, so the task ends.
    wait_for(&mut events, |e| {
        matches!(e, MatchLinkEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(client.view().phase, SessionPhase::Idle);
}

#[tokio::test]
async fn unrelated_error_is_surfaced_without_recovery() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();

    server.push(error_json("GAME_ERROR", "Room is full"));
    let event = wait_for(&mut events, |e| {
        matches!(e, MatchLinkEvent::ServerError { .. })
    })
    .await;
    assert_eq!(
        event,
        MatchLinkEvent::ServerError {
            kind: Some("GAME_ERROR".into()),
            message: "Room is full".into(),
        }
    );
    assert_eq!(server.reconnects(), 0);
    assert_eq!(client.view().phase, SessionPhase::Matchmaking);
}

// ════════════════════════════════════════════════════════════════════
// Transport lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn server_hang_up_resets_session_and_disconnects() {
    let (client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.request_match(0).await.unwrap();
    server.push(room_joined_json(&["A"]));
    server.hang_up();

    let event = wait_for(&mut events, |e| {
        matches!(e, MatchLinkEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(event, MatchLinkEvent::Disconnected { reason: None });
    assert!(events.recv().await.is_none());

    let view = client.view();
    assert_eq!(view.phase, SessionPhase::Idle);
    assert!(!view.connected);
    assert!(!view.participant_created);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn receive_error_disconnects_with_reason() {
    let (_client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    server.fail("reset by peer");

    let event = wait_for(&mut events, |e| {
        matches!(e, MatchLinkEvent::Disconnected { .. })
    })
    .await;
    let MatchLinkEvent::Disconnected { reason } = event else {
        unreachable!()
    };
    assert!(reason.unwrap().contains("reset by peer"));
}

#[tokio::test]
async fn malformed_message_is_skipped() {
    let (transport, server) = MockTransport::new("A");
    let (_client, mut events) = MatchLinkClient::start(transport, MatchLinkConfig::new());
    assert_eq!(next_event(&mut events).await, MatchLinkEvent::Connected);

    server.push("not json at all");
    server.push(r#"{"data":{}}"#);
    server.push(participant_created_json());
    assert_eq!(
        next_event(&mut events).await,
        MatchLinkEvent::ParticipantCreated
    );
}

#[tokio::test]
async fn shutdown_closes_transport_and_emits_disconnected() {
    let (mut client, mut events, server) = start_ready("A", MatchLinkConfig::new()).await;
    client.shutdown().await;

    assert!(server.is_closed());
    let remaining = drain(&mut events);
    assert_eq!(
        remaining.last(),
        Some(&MatchLinkEvent::Disconnected {
            reason: Some("client shut down".into())
        })
    );
    assert!(matches!(
        client.cancel_match().await,
        Err(MatchLinkError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn hand_off_survives_full_event_channel() {
    let (transport, server) = MockTransport::new("A");
    let config = MatchLinkConfig::new().with_event_channel_capacity(1);
    let (client, mut events) = MatchLinkClient::start(transport, config);

    // Leave `Connected` unread so the channel stays full.
    server.push(participant_created_json());
    let mut watch = client.watch();
    tokio::time::timeout(WAIT, watch.wait_for(|v| v.participant_created))
        .await
        .unwrap()
        .unwrap();
    client.request_match(0).await.unwrap();
    server.push(room_joined_json(&["A", "B"]));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(next_event(&mut events).await, MatchLinkEvent::Connected);
    assert!(matches!(
        next_event(&mut events).await,
        MatchLinkEvent::HandOff(_)
    ));
}

// ════════════════════════════════════════════════════════════════════
// Custom identity strategies
// ════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct AlwaysSecond;

impl PositionStrategy for AlwaysSecond {
    fn name(&self) -> &'static str {
        "always-second"
    }

    fn resolve(&self, _snapshot: &RoomSnapshot, _local: Option<&str>) -> Option<Position> {
        Some(Position::Player2)
    }
}

#[tokio::test]
async fn custom_resolver_decides_position() {
    let (transport, server) = MockTransport::new("A");
    let resolver = IdentityResolver::new(vec![Box::new(AlwaysSecond)]);
    let (client, mut events) =
        MatchLinkClient::start_with_resolver(transport, MatchLinkConfig::new(), resolver);
    assert_eq!(next_event(&mut events).await, MatchLinkEvent::Connected);
    server.push(participant_created_json());
    wait_for(&mut events, |e| matches!(e, MatchLinkEvent::ParticipantCreated)).await;

    client.request_match(0).await.unwrap();
    server.push(room_joined_json(&["A"]));
    let event = wait_for(&mut events, |e| {
        matches!(e, MatchLinkEvent::PositionResolved { .. })
    })
    .await;
    assert!(matches!(
        event,
        MatchLinkEvent::PositionResolved {
            position: Position::Player2,
            ..
        }
    ));
}
