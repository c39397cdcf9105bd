//! # Loopback Match Example
//!
//! Plays a full match-up against an in-process fake server: the server
//! registers the participant, seats an opponent that joined first, and the
//! client hands off to "gameplay" once the room is full.
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=debug cargo run --example loopback_match
//! ```

use async_trait::async_trait;
use matchlink_client::{
    MatchLinkClient, MatchLinkConfig, MatchLinkError, MatchLinkEvent, Transport, VariantCarousel,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const LOCAL_ID: &str = "loopback-local";
const OPPONENT_ID: &str = "loopback-opponent";

// ─────────────────────────────────────────────────────────────────────
// Loopback transport
// ─────────────────────────────────────────────────────────────────────

/// Client half of an in-process channel pair.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
    open: bool,
}

/// Server half: reads what the client sent, writes what it should receive.
pub struct LoopbackServer {
    rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
}

fn loopback_pair() -> (LoopbackTransport, LoopbackServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
            open: true,
        },
        LoopbackServer {
            rx: server_rx,
            tx: server_tx,
        },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), MatchLinkError> {
        self.tx
            .send(message)
            .map_err(|e| MatchLinkError::TransportSend(e.to_string()))
    }

    /// Cancel-safe because `UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, MatchLinkError>> {
        let message = self.rx.recv().await;
        if message.is_none() {
            self.open = false;
        }
        message.map(Ok)
    }

    async fn close(&mut self) -> Result<(), MatchLinkError> {
        self.open = false;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), MatchLinkError> {
        // Channels cannot be re-dialled.
        Err(MatchLinkError::TransportClosed)
    }

    fn connection_id(&self) -> Option<String> {
        Some(LOCAL_ID.to_owned())
    }

    fn is_connected(&self) -> bool {
        self.open
    }
}

// ─────────────────────────────────────────────────────────────────────
// Fake matchmaking server
// ─────────────────────────────────────────────────────────────────────

fn envelope(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

async fn run_server(mut server: LoopbackServer) {
    let _ = server.tx.send(envelope("participant-created", json!({})));

    while let Some(text) = server.rx.recv().await {
        tracing::info!("server received: {text}");
        let Ok(message) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if message["event"] != "find-match" {
            continue;
        }
        let session = message["data"]["sessionId"].clone();
        // The opponent has been waiting, so the local participant sits second.
        let _ = server.tx.send(envelope(
            "room-joined",
            json!({
                "roomId": "loopback-room",
                "sessionId": session,
                "players": [{ "socketId": OPPONENT_ID }, { "socketId": LOCAL_ID }],
            }),
        ));
    }
}

// ─────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (transport, server) = loopback_pair();
    tokio::spawn(run_server(server));

    let mut carousel = VariantCarousel::new(vec![3, 7, 11]);
    carousel.select_next();

    let (mut client, mut events) = MatchLinkClient::start(transport, MatchLinkConfig::new());

    while let Some(event) = events.recv().await {
        match event {
            MatchLinkEvent::ParticipantCreated => {
                let variant = carousel.selected().unwrap_or_default();
                let session = client.request_match(variant).await?;
                tracing::info!("requested match {session} with variant {variant}");
            }
            MatchLinkEvent::PhaseChanged { from, to, .. } => {
                tracing::info!("phase: {from} -> {to}");
            }
            MatchLinkEvent::PositionResolved { position, .. } => {
                tracing::info!("seated as {position}");
            }
            MatchLinkEvent::HandOff(hand_off) => {
                tracing::info!(
                    "game starting as {} with variant {} ({:?})",
                    hand_off.position,
                    hand_off.selected_variant,
                    hand_off.trigger
                );
                break;
            }
            MatchLinkEvent::Disconnected { reason } => {
                tracing::info!("disconnected: {}", reason.as_deref().unwrap_or("clean"));
                break;
            }
            other => tracing::debug!("event: {other:?}"),
        }
    }

    client.shutdown().await;
    Ok(())
}
