//! # MatchLink Client
//!
//! Client-side session reconciliation for two-player online matchmaking.
//!
//! The matchmaking server pushes a loosely ordered stream of events (room
//! joined, participant joined, participant ready, errors). This crate folds
//! that stream into one consistent session: a canonical room snapshot, a
//! stable local seat, a readiness set and a guarded phase graph that hands
//! control to gameplay exactly once per session.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement the [`Transport`] trait for any backend
//! - **Tolerant parsing**: legacy field spellings and malformed payloads degrade, never fail
//! - **Stale-event safe**: cancelled sessions and superseded timers are recognized and ignored
//! - **WebSocket built-in**: default `transport-websocket` feature provides `WebSocketTransport`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), matchlink_client::MatchLinkError> {
//! use matchlink_client::{MatchLinkClient, MatchLinkConfig, MatchLinkEvent, WebSocketTransport};
//!
//! let transport = WebSocketTransport::connect("ws://localhost:3000/match").await?;
//! let (client, mut events) = MatchLinkClient::start(transport, MatchLinkConfig::new());
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         MatchLinkEvent::ParticipantCreated => {
//!             client.request_match(0).await?;
//!         }
//!         MatchLinkEvent::HandOff(hand_off) => {
//!             println!("playing as {}", hand_off.position);
//!             break;
//!         }
//!         MatchLinkEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod identity;
pub mod machine;
pub mod protocol;
pub mod readiness;
pub mod room;
pub mod session;
pub mod transport;
pub mod transports;
pub mod variant;

// Re-export primary types for ergonomic imports.
pub use client::{MatchLinkClient, MatchLinkConfig};
pub use error::MatchLinkError;
pub use error_codes::ErrorCode;
pub use event::{HandOff, MatchLinkEvent, StartTrigger};
pub use identity::{IdentityResolver, Position, PositionStrategy};
pub use machine::{Effect, RetryPolicy, SessionMachine};
pub use protocol::{InboundEvent, MatchRequest, OutboundCommand};
pub use room::RoomSnapshot;
pub use session::{SessionId, SessionPhase, SessionView};
pub use transport::Transport;
pub use variant::VariantCarousel;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
