//! # WebSocket Match Example
//!
//! Connects to a matchmaking server over WebSocket, requests a match and
//! waits for the hand-off.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example websocket_match -- ws://localhost:3000/match 2
//! ```
//!
//! The optional second argument is the variant to play with.

use std::time::Duration;

use matchlink_client::{
    MatchLinkClient, MatchLinkConfig, MatchLinkEvent, SessionPhase, Transport, WebSocketTransport,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .unwrap_or_else(|| "ws://localhost:3000/match".to_owned());
    let variant: u32 = args.next().map(|v| v.parse()).transpose()?.unwrap_or(0);

    let transport = WebSocketTransport::connect_with_timeout(&url, Duration::from_secs(5)).await?;
    tracing::info!("connected as {:?}", transport.connection_id());

    let (mut client, mut events) = MatchLinkClient::start(transport, MatchLinkConfig::new());

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    MatchLinkEvent::ParticipantCreated => {
                        let session = client.request_match(variant).await?;
                        tracing::info!("requested match {session}");
                    }
                    MatchLinkEvent::PhaseChanged { from, to, .. } => {
                        tracing::info!("phase: {from} -> {to}");
                    }
                    MatchLinkEvent::RecoveryStarted { attempt, .. } => {
                        tracing::warn!("already in a room; reconnecting (attempt {attempt})");
                    }
                    MatchLinkEvent::HandOff(hand_off) => {
                        tracing::info!("game starting as {}", hand_off.position);
                        break;
                    }
                    MatchLinkEvent::MatchmakingFailed { reason, .. } => {
                        tracing::error!("matchmaking failed: {reason}");
                        break;
                    }
                    MatchLinkEvent::ServerError { message, .. } => {
                        tracing::error!("server error: {message}");
                    }
                    MatchLinkEvent::Disconnected { reason } => {
                        tracing::info!("disconnected: {}", reason.as_deref().unwrap_or("clean"));
                        break;
                    }
                    other => tracing::debug!("event: {other:?}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if client.view().phase == SessionPhase::Matchmaking {
                    client.cancel_match().await?;
                }
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
