//! Async driver for the session state machine.
//!
//! [`MatchLinkClient`] is a thin handle that talks to one background session
//! task over an unbounded MPSC channel. The task owns the transport, the
//! [`SessionMachine`] and the two cancellable timers (hand-off and reconnect
//! back-off), so every input is applied on one serial timeline. Events are
//! emitted on a bounded channel returned from [`MatchLinkClient::start`]; the
//! latest [`SessionView`] is published on a `watch` channel.
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = WebSocketTransport::connect("ws://localhost:3000/match").await?;
//! let (client, mut events) = MatchLinkClient::start(transport, MatchLinkConfig::new());
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         MatchLinkEvent::ParticipantCreated => {
//!             client.request_match(carousel.selected().unwrap_or(0)).await?;
//!         }
//!         MatchLinkEvent::HandOff(hand_off) => start_game(hand_off),
//!         MatchLinkEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, warn};

use crate::error::{MatchLinkError, Result};
use crate::event::MatchLinkEvent;
use crate::identity::IdentityResolver;
use crate::machine::{
    Effect, HandOffTicket, MachineConfig, ReconnectTicket, RetryPolicy, SessionMachine,
    DEFAULT_POPULATION_START_DELAY, DEFAULT_READINESS_START_DELAY,
};
use crate::protocol::InboundEvent;
use crate::session::{SessionId, SessionView};
use crate::transport::Transport;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`MatchLinkClient`].
///
/// # Example
///
/// ```
/// use matchlink_client::client::MatchLinkConfig;
/// use std::time::Duration;
///
/// let config = MatchLinkConfig::new()
///     .with_event_channel_capacity(512)
///     .with_population_start_delay(Duration::from_secs(3));
/// assert_eq!(config.readiness_start_delay, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchLinkConfig {
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, non-critical events are dropped with
    /// a warning. [`HandOff`](MatchLinkEvent::HandOff) and
    /// [`Disconnected`](MatchLinkEvent::Disconnected) are always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time the session task gets to close the transport on
    /// [`MatchLinkClient::shutdown`] before it is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Delay between a full room and the hand-off. Defaults to **2 seconds**.
    pub population_start_delay: Duration,
    /// Delay between completed readiness and the hand-off. Defaults to **1 second**.
    pub readiness_start_delay: Duration,
    /// Bounds of the "already in a room" recovery.
    pub retry: RetryPolicy,
}

impl Default for MatchLinkConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            population_start_delay: DEFAULT_POPULATION_START_DELAY,
            readiness_start_delay: DEFAULT_READINESS_START_DELAY,
            retry: RetryPolicy::default(),
        }
    }
}

impl MatchLinkConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity of the bounded event channel (clamped to at least 1).
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the graceful shutdown timeout. Zero aborts the task immediately.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the delay between a full room and the hand-off.
    #[must_use]
    pub fn with_population_start_delay(mut self, delay: Duration) -> Self {
        self.population_start_delay = delay;
        self
    }

    /// Set the delay between completed readiness and the hand-off.
    #[must_use]
    pub fn with_readiness_start_delay(mut self, delay: Duration) -> Self {
        self.readiness_start_delay = delay;
        self
    }

    /// Set the recovery bounds.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            population_start_delay: self.population_start_delay,
            readiness_start_delay: self.readiness_start_delay,
            retry: self.retry.clone(),
        }
    }
}

// ── Client handle ───────────────────────────────────────────────────

enum Command {
    RequestMatch {
        selected_variant: u32,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    CancelMatch {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Async client handle for one matchmaking connection.
///
/// Created via [`MatchLinkClient::start`], which spawns the session task and
/// returns this handle together with the event receiver.
pub struct MatchLinkClient {
    /// Sender half of the command channel to the session task.
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Latest view published by the session task.
    view_rx: watch::Receiver<SessionView>,
    /// Handle to the session task.
    task: Option<tokio::task::JoinHandle<()>>,
    /// Oneshot sender to stop the session task gracefully.
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl MatchLinkClient {
    /// Start the session task on a connected transport.
    ///
    /// Returns the client handle and the event receiver. The receiver yields
    /// `None` once the session task has exited.
    pub fn start(
        transport: impl Transport,
        config: MatchLinkConfig,
    ) -> (Self, mpsc::Receiver<MatchLinkEvent>) {
        Self::start_with_resolver(transport, config, IdentityResolver::default())
    }

    /// Like [`start`](Self::start), with custom position strategies.
    pub fn start_with_resolver(
        transport: impl Transport,
        config: MatchLinkConfig,
        resolver: IdentityResolver,
    ) -> (Self, mpsc::Receiver<MatchLinkEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<MatchLinkEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let mut machine = SessionMachine::with_resolver(config.machine_config(), resolver);
        machine.set_connection(transport.is_connected(), transport.connection_id());
        let (view_tx, view_rx) = watch::channel(machine.view());

        let session = SessionTask {
            transport,
            machine,
            event_tx,
            view_tx,
            hand_off: Timer::new(),
            reconnect: Timer::new(),
        };
        let task = tokio::spawn(session.run(cmd_rx, shutdown_rx));

        let client = Self {
            cmd_tx,
            view_rx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };
        (client, event_rx)
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Open a new session and ask the server for a match.
    ///
    /// Resolves once the request has been written to the transport.
    ///
    /// # Errors
    ///
    /// - [`MatchLinkError::NotConnected`] if the transport is down or the
    ///   client was shut down.
    /// - [`MatchLinkError::ParticipantNotCreated`] before `participant-created`.
    /// - [`MatchLinkError::SessionActive`] while a session is live.
    /// - [`MatchLinkError::TransportClosed`] if the request could not be sent.
    pub async fn request_match(&self, selected_variant: u32) -> Result<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::RequestMatch {
            selected_variant,
            reply,
        })?;
        rx.await.map_err(|_| MatchLinkError::NotConnected)?
    }

    /// Withdraw the pending match request.
    ///
    /// # Errors
    ///
    /// Returns [`MatchLinkError::InvalidPhase`] unless the session is still
    /// matchmaking, or [`MatchLinkError::NotConnected`] after shutdown.
    pub async fn cancel_match(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::CancelMatch { reply })?;
        rx.await.map_err(|_| MatchLinkError::NotConnected)?
    }

    /// Shut down the client, closing the transport and stopping the session task.
    pub async fn shutdown(&mut self) {
        debug!("MatchLinkClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session task did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session task aborted: {join_err}");
                    }
                }
            }
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    /// The latest published [`SessionView`].
    pub fn view(&self) -> SessionView {
        self.view_rx.borrow().clone()
    }

    /// A receiver that is notified whenever the view changes.
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view_rx.clone()
    }

    /// Returns `true` while the transport is believed to be connected.
    pub fn is_connected(&self) -> bool {
        self.task.is_some() && self.view_rx.borrow().connected
    }

    fn submit(&self, command: Command) -> Result<()> {
        if self.task.is_none() {
            return Err(MatchLinkError::NotConnected);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| MatchLinkError::NotConnected)
    }
}

impl std::fmt::Debug for MatchLinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view_rx.borrow();
        f.debug_struct("MatchLinkClient")
            .field("phase", &view.phase)
            .field("session", &view.session)
            .field("connected", &view.connected)
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for MatchLinkClient {
    fn drop(&mut self) {
        // No executor context for a graceful close here.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session task ────────────────────────────────────────────────────

/// A one-shot timer that can be re-armed and disarmed.
struct Timer<K> {
    sleep: Pin<Box<Sleep>>,
    ticket: Option<K>,
}

impl<K: Copy> Timer<K> {
    fn new() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            ticket: None,
        }
    }

    fn arm(&mut self, ticket: K, delay: Duration) {
        self.sleep.as_mut().reset(Instant::now() + delay);
        self.ticket = Some(ticket);
    }

    fn disarm(&mut self) {
        self.ticket = None;
    }

    fn is_armed(&self) -> bool {
        self.ticket.is_some()
    }
}

struct SessionTask<T> {
    transport: T,
    machine: SessionMachine,
    event_tx: mpsc::Sender<MatchLinkEvent>,
    view_tx: watch::Sender<SessionView>,
    hand_off: Timer<HandOffTicket>,
    reconnect: Timer<ReconnectTicket>,
}

impl<T: Transport> SessionTask<T> {
    /// Multiplexes commands, timers and inbound messages via `tokio::select!`.
    ///
    /// Exits when:
    /// - the command channel closes or shutdown is signalled
    /// - the transport closes or fails with no recovery pending
    /// - a send fails
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("session task started");
        emit_event(&self.event_tx, MatchLinkEvent::Connected).await;

        loop {
            let transport_up = self.transport.is_connected();
            if !transport_up && !self.reconnect.is_armed() {
                debug!("transport down with no recovery pending");
                self.transport_lost(Some("transport closed".into())).await;
                break;
            }

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Err(e) = self.on_command(cmd).await {
                                error!("transport send error: {e}");
                                self.transport_lost(Some(format!("transport send error: {e}"))).await;
                                break;
                            }
                        }
                        // Command channel closed: client handle dropped.
                        None => {
                            debug!("command channel closed, shutting down session task");
                            self.close().await;
                            break;
                        }
                    }
                }

                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    self.close().await;
                    break;
                }

                _ = &mut self.hand_off.sleep, if self.hand_off.is_armed() => {
                    if let Some(ticket) = self.hand_off.ticket.take() {
                        let effects = self.machine.hand_off_elapsed(ticket);
                        if let Err(e) = self.apply(effects).await {
                            self.transport_lost(Some(format!("transport send error: {e}"))).await;
                            break;
                        }
                    }
                }

                _ = &mut self.reconnect.sleep, if self.reconnect.is_armed() => {
                    if let Some(ticket) = self.reconnect.ticket.take() {
                        debug!("reconnect attempt {} for session {}", ticket.attempt, ticket.session);
                        let outcome = match self.transport.reconnect().await {
                            Ok(()) => Ok(self.transport.connection_id()),
                            Err(e) => Err(e),
                        };
                        let effects = self.machine.reconnect_finished(ticket, outcome);
                        if let Err(e) = self.apply(effects).await {
                            self.transport_lost(Some(format!("transport send error: {e}"))).await;
                            break;
                        }
                    }
                }

                incoming = self.transport.recv(), if transport_up => {
                    match incoming {
                        Some(Ok(text)) => match InboundEvent::from_json(&text) {
                            Ok(event) => {
                                debug!("received {}", event.name());
                                let effects = self.machine.handle(event);
                                if let Err(e) = self.apply(effects).await {
                                    self.transport_lost(Some(format!("transport send error: {e}"))).await;
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("failed to parse server message: {e}, raw: {text}");
                            }
                        },
                        Some(Err(e)) if self.reconnect.is_armed() => {
                            debug!("connection failed while recovery pending: {e}");
                        }
                        None if self.reconnect.is_armed() => {
                            debug!("connection closed while recovery pending");
                        }
                        Some(Err(e)) => {
                            error!("transport receive error: {e}");
                            self.transport_lost(Some(format!("transport receive error: {e}"))).await;
                            break;
                        }
                        None => {
                            debug!("transport closed by server");
                            self.transport_lost(None).await;
                            break;
                        }
                    }
                }
            }

            self.publish();
        }

        debug!("session task exited");
    }

    async fn on_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::RequestMatch {
                selected_variant,
                reply,
            } => match self.machine.request_match(selected_variant) {
                Ok((session, effects)) => {
                    let sent = self.apply(effects).await;
                    let answer = match &sent {
                        Ok(()) => Ok(session),
                        Err(_) => Err(MatchLinkError::TransportClosed),
                    };
                    let _ = reply.send(answer);
                    sent
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Ok(())
                }
            },
            Command::CancelMatch { reply } => match self.machine.cancel() {
                Ok(effects) => {
                    let sent = self.apply(effects).await;
                    let answer = match &sent {
                        Ok(()) => Ok(()),
                        Err(_) => Err(MatchLinkError::TransportClosed),
                    };
                    let _ = reply.send(answer);
                    sent
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Ok(())
                }
            },
        }
    }

    /// Carry out the machine's effects in order. Stops at the first failed send.
    async fn apply(&mut self, effects: Vec<Effect>) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::Send(command) => {
                    let json = serde_json::to_string(&command)?;
                    self.transport.send(json).await?;
                }
                Effect::ScheduleHandOff { ticket, delay } => self.hand_off.arm(ticket, delay),
                Effect::CancelHandOff => self.hand_off.disarm(),
                Effect::ScheduleReconnect { ticket, delay } => self.reconnect.arm(ticket, delay),
                Effect::CancelReconnect => self.reconnect.disarm(),
                Effect::Emit(event) if event.is_critical() => {
                    emit_critical(&self.event_tx, event).await;
                }
                Effect::Emit(event) => emit_event(&self.event_tx, event).await,
            }
        }
        Ok(())
    }

    /// Tear down the session after the transport went away.
    async fn transport_lost(&mut self, reason: Option<String>) {
        let effects = self.machine.disconnected();
        // Tear-down never sends, so this cannot fail.
        let _ = self.apply(effects).await;
        self.publish();
        emit_critical(&self.event_tx, MatchLinkEvent::Disconnected { reason }).await;
    }

    async fn close(&mut self) {
        if let Err(e) = self.transport.close().await {
            debug!("transport close failed: {e}");
        }
        self.transport_lost(Some("client shut down".into())).await;
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.machine.view());
    }
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event to avoid blocking the session task.
async fn emit_event(event_tx: &mpsc::Sender<MatchLinkEvent>, event: MatchLinkEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("event channel full, dropping event: {dropped:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// Emit an event that must never be silently dropped, waiting for capacity.
async fn emit_critical(event_tx: &mpsc::Sender<MatchLinkEvent>, event: MatchLinkEvent) {
    if event_tx.send(event).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn config_defaults() {
        let config = MatchLinkConfig::new();
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.population_start_delay, Duration::from_secs(2));
        assert_eq!(config.readiness_start_delay, Duration::from_secs(1));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn config_builder_methods() {
        let retry = RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        };
        let config = MatchLinkConfig::new()
            .with_event_channel_capacity(0)
            .with_shutdown_timeout(Duration::from_millis(100))
            .with_readiness_start_delay(Duration::ZERO)
            .with_retry_policy(retry.clone());
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(100));
        assert_eq!(config.machine_config().readiness_start_delay, Duration::ZERO);
        assert_eq!(config.machine_config().retry, retry);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_once_after_arming() {
        let mut timer = Timer::<u8>::new();
        assert!(!timer.is_armed());
        timer.arm(7, Duration::from_secs(2));
        (&mut timer.sleep).await;
        assert_eq!(timer.ticket.take(), Some(7));
        timer.arm(8, Duration::from_secs(1));
        timer.disarm();
        assert!(!timer.is_armed());
    }

    /// Transport that hangs forever in `close()` so shutdown timeout/abort can be tested.
    struct HangingCloseTransport {
        close_called: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for HangingCloseTransport {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::Release);
        }
    }

    #[async_trait]
    impl Transport for HangingCloseTransport {
        async fn send(&mut self, _message: String) -> Result<()> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            self.close_called.store(true, Ordering::Release);
            std::future::pending().await
        }

        async fn reconnect(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn shutdown_timeout_aborts_stuck_session_task() {
        let close_called = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let transport = HangingCloseTransport {
            close_called: Arc::clone(&close_called),
            dropped: Arc::clone(&dropped),
        };
        let config = MatchLinkConfig::new().with_shutdown_timeout(Duration::from_millis(20));
        let (mut client, mut events) = MatchLinkClient::start(transport, config);

        assert_eq!(events.recv().await.unwrap(), MatchLinkEvent::Connected);
        client.shutdown().await;

        assert!(close_called.load(Ordering::Acquire));
        assert!(dropped.load(Ordering::Acquire));
        assert!(!client.is_connected());
        assert!(matches!(
            client.request_match(0).await,
            Err(MatchLinkError::NotConnected)
        ));
    }
}
