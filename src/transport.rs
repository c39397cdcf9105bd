//! Transport abstraction for the matchmaking event protocol.
//!
//! The [`Transport`] trait is a bidirectional text message channel between
//! the client and the matchmaking server. Every message is one JSON envelope,
//! so each implementation handles framing internally.
//!
//! Initial connection setup is not part of the trait: build a connected
//! transport externally, then pass it to
//! [`MatchLinkClient::start`](crate::MatchLinkClient::start). The trait does
//! own *re*-connection, because the "already in a room" recovery needs a
//! fresh connection in the middle of a session.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use matchlink_client::error::MatchLinkError;
//! use matchlink_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), MatchLinkError> {
//!         // Send one JSON envelope.
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, MatchLinkError>> {
//!         // Next JSON envelope; `None` once the server closed the connection.
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), MatchLinkError> {
//!         todo!()
//!     }
//!
//!     async fn reconnect(&mut self) -> Result<(), MatchLinkError> {
//!         // Drop the current connection and open a fresh one.
//!         todo!()
//!     }
//!
//!     fn is_connected(&self) -> bool {
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::MatchLinkError;
use crate::protocol::ConnectionId;

/// A bidirectional text message transport to the matchmaking server.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the session task
/// polls it inside `tokio::select!`. Channel-based implementations (e.g.
/// wrapping `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one JSON text message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`MatchLinkError::TransportSend`] if the message could not be
    /// sent, or [`MatchLinkError::TransportClosed`] after [`close`](Transport::close).
    async fn send(&mut self, message: String) -> Result<(), MatchLinkError>;

    /// Receive the next JSON text message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))` for a complete message
    /// - `Some(Err(e))` for a transport error
    /// - `None` once the connection was closed by the server
    async fn recv(&mut self) -> Option<Result<String, MatchLinkError>>;

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Resources are released
    /// either way.
    async fn close(&mut self) -> Result<(), MatchLinkError>;

    /// Drop the current connection and establish a fresh one to the same server.
    ///
    /// On success the transport reports a new [`connection_id`](Transport::connection_id).
    ///
    /// # Errors
    ///
    /// Returns an error if the new connection cannot be established; the
    /// transport is then disconnected.
    async fn reconnect(&mut self) -> Result<(), MatchLinkError>;

    /// Identifier the server knows the local participant by on this connection.
    fn connection_id(&self) -> Option<ConnectionId> {
        None
    }

    /// Returns `true` while the connection is usable.
    fn is_connected(&self) -> bool;
}
