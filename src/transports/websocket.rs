//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] identifies each connection with a client-generated
//! UUID, passed to the server as the `connectionId` query parameter. A
//! [`reconnect`](Transport::reconnect) dials the same URL again with a fresh
//! identifier, which is what the "already in a room" recovery relies on.
//!
//! # Feature gate
//!
//! Only available with the `transport-websocket` feature (enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), matchlink_client::MatchLinkError> {
//! use matchlink_client::{Transport, WebSocketTransport};
//!
//! let mut transport = WebSocketTransport::connect("ws://localhost:3000/match").await?;
//! println!("connected as {:?}", transport.connection_id());
//!
//! if let Some(Ok(msg)) = transport.recv().await {
//!     println!("received: {msg}");
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

use crate::error::MatchLinkError;
use crate::protocol::ConnectionId;
use crate::transport::Transport;

/// Query parameter carrying the client-generated connection identifier.
pub const CONNECTION_ID_PARAM: &str = "connectionId";

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe: dropping its future before it
/// completes does not lose a message.
#[derive(Debug)]
pub struct WebSocketTransport {
    url: Option<String>,
    stream: Option<WsStream>,
    connection_id: Option<ConnectionId>,
}

impl WebSocketTransport {
    /// Connect to `url` under a freshly generated connection identifier.
    ///
    /// # Errors
    ///
    /// Returns [`MatchLinkError::Io`] if the URL is invalid or the connection
    /// cannot be established. I/O error kinds are preserved; all other
    /// failures map to [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, MatchLinkError> {
        let (stream, connection_id) = dial(url).await?;
        Ok(Self {
            url: Some(url.to_owned()),
            stream: Some(stream),
            connection_id: Some(connection_id),
        })
    }

    /// Like [`connect`](Self::connect), but fails with
    /// [`MatchLinkError::Timeout`] if the connection is not up within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`MatchLinkError::Timeout`] if the deadline elapses, or any
    /// error that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: std::time::Duration,
    ) -> Result<Self, MatchLinkError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| MatchLinkError::Timeout)?
    }

    /// Wrap an already-established stream (custom TLS, proxies, headers).
    ///
    /// Such a transport has no URL to dial again, so
    /// [`reconnect`](Transport::reconnect) fails with
    /// [`ErrorKind::Unsupported`](std::io::ErrorKind::Unsupported).
    pub fn from_stream(stream: WsStream, connection_id: Option<ConnectionId>) -> Self {
        Self {
            url: None,
            stream: Some(stream),
            connection_id,
        }
    }
}

/// Append the connection identifier to `url` as a query parameter.
fn url_with_connection_id(url: &str, connection_id: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{CONNECTION_ID_PARAM}={connection_id}")
}

async fn dial(url: &str) -> Result<(WsStream, ConnectionId), MatchLinkError> {
    let connection_id = Uuid::new_v4().to_string();
    let target = url_with_connection_id(url, &connection_id);
    tracing::debug!(url = %url, connection_id = %connection_id, "connecting to matchmaking server");

    let (stream, _response) = tokio_tungstenite::connect_async(target.as_str())
        .await
        .map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            MatchLinkError::Io(std::io::Error::new(kind, e))
        })?;

    tracing::info!(url = %url, connection_id = %connection_id, "WebSocket connection established");
    Ok((stream, connection_id))
}

async fn next_text(stream: &mut WsStream) -> Option<Result<String, MatchLinkError>> {
    loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Some(Err(MatchLinkError::TransportReceive(e.to_string()))),
            None => return None,
        };

        match msg {
            Message::Text(text) => return Some(Ok(text.to_string())),
            Message::Close(frame) => {
                tracing::debug!(?frame, "received WebSocket close frame");
                return None;
            }
            // tungstenite queues the pong itself.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                tracing::warn!("received unexpected binary WebSocket frame, skipping");
            }
            Message::Frame(_) => {
                tracing::debug!("received raw WebSocket frame, skipping");
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), MatchLinkError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(MatchLinkError::TransportClosed);
        };
        stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| MatchLinkError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, MatchLinkError>> {
        let stream = self.stream.as_mut()?;
        let result = next_text(stream).await;
        if !matches!(result, Some(Ok(_))) {
            self.stream = None;
        }
        result
    }

    async fn close(&mut self) -> Result<(), MatchLinkError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        stream
            .close(None)
            .await
            .map_err(|e| MatchLinkError::TransportSend(e.to_string()))
    }

    async fn reconnect(&mut self) -> Result<(), MatchLinkError> {
        let Some(url) = self.url.clone() else {
            return Err(MatchLinkError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "transport was built from a raw stream and cannot reconnect",
            )));
        };

        if let Some(mut old) = self.stream.take() {
            if let Err(e) = old.close(None).await {
                tracing::debug!("closing previous connection failed: {e}");
            }
        }
        self.connection_id = None;

        let (stream, connection_id) = dial(&url).await?;
        self.stream = Some(stream);
        self.connection_id = Some(connection_id);
        Ok(())
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id.clone()
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
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

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[test]
    fn connection_id_is_appended_as_query_parameter() {
        assert_eq!(
            url_with_connection_id("ws://host/match", "abc"),
            "ws://host/match?connectionId=abc"
        );
        assert_eq!(
            url_with_connection_id("ws://host/match?v=2", "abc"),
            "ws://host/match?v=2&connectionId=abc"
        );
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url")
            .await
            .unwrap_err();
        assert!(matches!(err, MatchLinkError::Io(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, MatchLinkError::Io(_)));
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Accept `connections` WebSocket connections, reporting each request URI
    /// and running `handler` on each stream.
    async fn start_mock_server<F, Fut>(
        connections: usize,
        handler: F,
    ) -> (String, mpsc::UnboundedReceiver<String>)
    where
        F: Fn(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, uri_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for _ in 0..connections {
                let (tcp, _) = listener.accept().await.unwrap();
                let uri_tx = uri_tx.clone();
                let ws = tokio_tungstenite::accept_hdr_async(
                    tcp,
                    move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let _ = uri_tx.send(req.uri().to_string());
                        Ok(resp)
                    },
                )
                .await
                .unwrap();
                tokio::spawn(handler(ws));
            }
        });

        (format!("ws://{addr}/match"), uri_rx)
    }

    async fn drain(mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_sends_connection_id() {
        let (url, mut uris) = start_mock_server(1, drain).await;
        let transport = WebSocketTransport::connect(&url).await.unwrap();

        let id = transport.connection_id().unwrap();
        let uri = uris.recv().await.unwrap();
        assert_eq!(uri, format!("/match?connectionId={id}"));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn recv_receives_text_and_skips_binary() {
        let (url, _uris) = start_mock_server(1, |mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"event":"left-room"}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, r#"{"event":"left-room"}"#);
    }

    #[tokio::test]
    async fn close_frame_ends_stream_and_disconnects() {
        let (url, _uris) = start_mock_server(1, |mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert!(transport.recv().await.is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let (url, _uris) = start_mock_server(1, drain).await;
        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        // Second close is a no-op.
        transport.close().await.unwrap();

        let err = transport.send("oops".to_owned()).await.unwrap_err();
        assert!(matches!(err, MatchLinkError::TransportClosed));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn reconnect_dials_again_with_fresh_identifier() {
        let (url, mut uris) = start_mock_server(2, drain).await;
        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let first = transport.connection_id().unwrap();

        transport.reconnect().await.unwrap();
        let second = transport.connection_id().unwrap();

        assert_ne!(first, second);
        assert!(uris.recv().await.unwrap().ends_with(&first));
        assert!(uris.recv().await.unwrap().ends_with(&second));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn reconnect_without_url_is_unsupported() {
        let (url, _uris) = start_mock_server(1, drain).await;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let mut transport = WebSocketTransport::from_stream(stream, Some("fixed".into()));

        assert_eq!(transport.connection_id().as_deref(), Some("fixed"));
        match transport.reconnect().await.unwrap_err() {
            MatchLinkError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::Unsupported),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        // Non-routable address guarantees the deadline is hit.
        let err = WebSocketTransport::connect_with_timeout(
            "ws://192.0.2.1:1",
            std::time::Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MatchLinkError::Timeout));
    }

    #[tokio::test]
    async fn send_round_trip() {
        let (url, _uris) = start_mock_server(1, |mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport
            .send(r#"{"event":"cancel-matchmaking"}"#.to_owned())
            .await
            .unwrap();
        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, r#"{"event":"cancel-matchmaking"}"#);
    }
}
