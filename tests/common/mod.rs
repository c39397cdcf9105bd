#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for matchlink client integration tests.
//!
//! Provides a channel-driven [`MockTransport`] whose server side is scripted
//! through a [`MockServer`] handle, plus helpers for building server event
//! JSON.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use matchlink_client::{MatchLinkError, Transport};
use serde_json::{json, Value};
use tokio::sync::mpsc;

type Inbound = Option<Result<String, MatchLinkError>>;

// ── MockTransport ───────────────────────────────────────────────────

/// State shared between the transport and its [`MockServer`].
#[derive(Default)]
struct Shared {
    sent: StdMutex<Vec<String>>,
    closed: AtomicBool,
    reconnects: AtomicUsize,
    failing_reconnects: AtomicUsize,
}

/// A mock transport fed by a [`MockServer`].
///
/// `recv()` yields whatever the server pushed, in order, and waits when
/// nothing is queued. Pushing `None` closes the connection; a later
/// `reconnect()` reopens it under a new connection identifier.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Inbound>,
    shared: Arc<Shared>,
    base_id: String,
    connection_id: Option<String>,
    connected: bool,
}

/// Server-side handle of a [`MockTransport`].
#[derive(Clone)]
pub struct MockServer {
    tx: mpsc::UnboundedSender<Inbound>,
    shared: Arc<Shared>,
}

impl MockTransport {
    /// A connected transport known to the server as `connection_id`.
    pub fn new(connection_id: &str) -> (Self, MockServer) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let transport = Self {
            incoming,
            shared: Arc::clone(&shared),
            base_id: connection_id.to_owned(),
            connection_id: Some(connection_id.to_owned()),
            connected: true,
        };
        (transport, MockServer { tx, shared })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), MatchLinkError> {
        if !self.connected {
            return Err(MatchLinkError::TransportClosed);
        }
        self.shared.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, MatchLinkError>> {
        match self.incoming.recv().await {
            Some(Some(Ok(text))) => Some(Ok(text)),
            Some(Some(Err(e))) => {
                self.connected = false;
                Some(Err(e))
            }
            Some(None) => {
                self.connected = false;
                None
            }
            // Server handle dropped: stay silent until shutdown.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), MatchLinkError> {
        self.connected = false;
        self.shared.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), MatchLinkError> {
        let attempt = self.shared.reconnects.fetch_add(1, Ordering::AcqRel) + 1;
        let failing = self.shared.failing_reconnects.load(Ordering::Acquire);
        if failing > 0 {
            self.shared
                .failing_reconnects
                .store(failing - 1, Ordering::Release);
            self.connected = false;
            self.connection_id = None;
            return Err(MatchLinkError::TransportReceive("connection refused".into()));
        }
        self.connected = true;
        self.connection_id = Some(reconnected_id(&self.base_id, attempt));
        Ok(())
    }

    fn connection_id(&self) -> Option<String> {
        self.connection_id.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Connection identifier the mock reports after its `attempt`-th reconnect.
pub fn reconnected_id(base: &str, attempt: usize) -> String {
    format!("{base}-r{attempt}")
}

impl MockServer {
    /// Deliver one JSON message to the client.
    pub fn push(&self, json: impl Into<String>) {
        let _ = self.tx.send(Some(Ok(json.into())));
    }

    /// Close the connection from the server side.
    pub fn hang_up(&self) {
        let _ = self.tx.send(None);
    }

    /// Fail the connection with a receive error.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .tx
            .send(Some(Err(MatchLinkError::TransportReceive(reason.into()))));
    }

    /// Make the next `n` reconnect attempts fail.
    pub fn refuse_reconnects(&self, n: usize) {
        self.shared.failing_reconnects.store(n, Ordering::Release);
    }

    /// Every message the client sent, parsed.
    pub fn sent(&self) -> Vec<Value> {
        self.shared
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    /// Event names of every message the client sent.
    pub fn sent_events(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|v| v["event"].as_str().unwrap().to_owned())
            .collect()
    }

    /// Number of reconnect attempts made.
    pub fn reconnects(&self) -> usize {
        self.shared.reconnects.load(Ordering::Acquire)
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

// ── JSON helper functions ───────────────────────────────────────────

fn envelope(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

fn players(ids: &[&str]) -> Value {
    Value::Array(ids.iter().map(|id| json!({ "socketId": id })).collect())
}

/// `participant-created` with no payload.
pub fn participant_created_json() -> String {
    json!({ "event": "participant-created" }).to_string()
}

/// `room-joined` for `room-1` listing `ids` in join order.
pub fn room_joined_json(ids: &[&str]) -> String {
    room_joined_in("room-1", ids)
}

/// `room-joined` for `room` listing `ids` in join order.
pub fn room_joined_in(room: &str, ids: &[&str]) -> String {
    envelope(
        "room-joined",
        json!({ "roomId": room, "players": players(ids) }),
    )
}

/// `participant-joined-room` listing `ids` in join order.
pub fn participant_joined_json(ids: &[&str]) -> String {
    envelope(
        "participant-joined-room",
        json!({ "roomId": "room-1", "players": players(ids) }),
    )
}

/// `participant-ready` from `id`.
pub fn ready_json(id: &str) -> String {
    envelope("participant-ready", json!({ "socketId": id }))
}

/// `participant-ready` carrying the authoritative all-ready flag.
pub fn all_ready_json() -> String {
    envelope("participant-ready", json!({ "allPlayersReady": true }))
}

/// `left-room` with no payload.
pub fn left_room_json() -> String {
    json!({ "event": "left-room" }).to_string()
}

/// `error` with the given category and message.
pub fn error_json(kind: &str, message: &str) -> String {
    envelope("error", json!({ "type": kind, "message": message }))
}
