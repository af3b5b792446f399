//! Connection lifecycle, heartbeat and reliable delivery.
//!
//! [`ConnectionManager`] runs as a single tokio task that exclusively owns
//! the transport, the inactivity timer, the [`PendingAckTable`] and the
//! [`ProcessedFrameCache`]. Callers talk to it through a cloneable
//! [`ConnectionHandle`]; connection state is published on a `watch`
//! channel, and frames meant for the application are forwarded as
//! [`SessionEvent`]s.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected -> Disconnected`.
//! The backend drives liveness: it pings, the client answers with a pong,
//! and a session that sees no ping for the inactivity window is closed.

pub mod ack;
pub mod dedup;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use chatlink_proto::codec::{self, CodecError};
use chatlink_proto::frame::{ChatMessage, Frame};
use chatlink_proto::message::{ClientId, ConversationId, ImageData, MessageId, Timestamp};

use crate::session::SessionIdentity;
use crate::transport::{Connector, Transport, TransportError};

pub use ack::{Confirmation, DEFAULT_ACK_TIMEOUT, PendingAckTable, PendingConfirmation};
pub use dedup::{DEFAULT_DEDUP_CAPACITY, FrameKey, ProcessedFrameCache};

/// Error shown when the transport cannot be opened or fails.
pub const CONNECTION_FAILED: &str = "Connection failed";

/// Error shown when the session is closed for lack of heartbeats.
pub const SESSION_INACTIVE: &str = "Session ended due to inactivity";

/// Default time without a backend ping before the session is closed.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(180);

/// Default timeout for opening the transport.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stand-in deadline for timeouts too large to add to the clock (~30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No transport.
    #[default]
    Disconnected,
    /// Transport opening or handshake in progress.
    Connecting,
    /// Session granted by the backend.
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

/// Published connection state.
///
/// `conversation_id` is `Some` only while `status` is
/// [`ConnectionStatus::Connected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Lifecycle status.
    pub status: ConnectionStatus,
    /// Durable client id.
    pub client_id: ClientId,
    /// Conversation granted by the backend.
    pub conversation_id: Option<ConversationId>,
    /// Why the connection was lost, if it was not closed on request.
    pub error: Option<String>,
}

impl ConnectionState {
    fn initial(client_id: ClientId) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            client_id,
            conversation_id: None,
            error: None,
        }
    }

    /// Whether a session is currently granted.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur when sending a message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No session is granted; nothing was transmitted.
    #[error("not connected to chat server")]
    NotConnected,

    /// The backend did not confirm the message in time.
    #[error("confirmation timed out")]
    ConfirmationTimeout,

    /// A message with this id is already awaiting confirmation.
    #[error("message {0} is already awaiting confirmation")]
    DuplicateMessageId(MessageId),

    /// The connection was closed before the confirmation arrived.
    #[error("disconnected before confirmation")]
    Disconnected,

    /// Transmitting the frame failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Encoding the frame failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The connection task has exited.
    #[error("connection manager stopped")]
    ManagerStopped,
}

/// The connection task has exited and can no longer take commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection manager stopped")]
pub struct ManagerStopped;

impl From<ManagerStopped> for SendError {
    fn from(_: ManagerStopped) -> Self {
        Self::ManagerStopped
    }
}

// ---------------------------------------------------------------------------
// Configuration and messages
// ---------------------------------------------------------------------------

/// Timers and buffer sizes of the connection task.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on opening the transport.
    pub connect_timeout: Duration,
    /// Time without a ping before the session is closed.
    pub inactivity_timeout: Duration,
    /// Time allowed for a `confirm` after a send.
    pub ack_timeout: Duration,
    /// Number of processed frame keys remembered for dedup.
    pub dedup_capacity: usize,
    /// Capacity of the handle -> task command channel.
    pub channel_capacity: usize,
    /// Capacity of the task -> application event channel.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            channel_capacity: 256,
            event_buffer: 64,
        }
    }
}

/// A user message to send. Missing id is generated at send time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Caller-chosen id, e.g. the id of the optimistic local copy.
    pub message_id: Option<MessageId>,
    /// Text content.
    pub content: Option<String>,
    /// Attached images.
    pub images: Vec<ImageData>,
}

impl OutboundMessage {
    /// A text-only message.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            message_id: None,
            content: Some(content.into()),
            images: Vec::new(),
        }
    }

    /// Use `id` instead of generating one.
    #[must_use]
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Attach images.
    #[must_use]
    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        self.images = images;
        self
    }
}

/// What the connection task reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection state changed.
    Connection(ConnectionState),
    /// An application frame (`confirm`, `response`, `image_status`,
    /// `status` or `error`) arrived and passed dedup.
    Frame(Frame),
}

enum Command {
    Connect,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Send {
        message: OutboundMessage,
        reply: oneshot::Sender<Result<PendingConfirmation, SendError>>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Start connecting. No-op if a transport is open or opening.
    ///
    /// Returns once the request is queued; watch the state (or use
    /// [`wait_for_status`](Self::wait_for_status)) for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerStopped`] if the connection task has exited.
    pub async fn connect(&self) -> Result<(), ManagerStopped> {
        self.cmd_tx
            .send(Command::Connect)
            .await
            .map_err(|_| ManagerStopped)
    }

    /// Close the connection on request.
    ///
    /// Pending sends fail with [`SendError::Disconnected`]. Returns once
    /// the task has torn the connection down.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerStopped`] if the connection task has exited.
    pub async fn disconnect(&self) -> Result<(), ManagerStopped> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Disconnect { done })
            .await
            .map_err(|_| ManagerStopped)?;
        rx.await.map_err(|_| ManagerStopped)
    }

    /// Send a message and return a future for its confirmation.
    ///
    /// The outer result reports whether the frame was transmitted; the
    /// returned [`PendingConfirmation`] resolves when the backend confirms
    /// it or the confirmation times out.
    ///
    /// # Errors
    ///
    /// - [`SendError::NotConnected`] without a granted session.
    /// - [`SendError::DuplicateMessageId`] if the id is already pending.
    /// - [`SendError::Transport`] / [`SendError::Codec`] if transmit failed.
    /// - [`SendError::ManagerStopped`] if the connection task has exited.
    pub async fn send(&self, message: OutboundMessage) -> Result<PendingConfirmation, SendError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { message, reply })
            .await
            .map_err(|_| SendError::ManagerStopped)?;
        rx.await.map_err(|_| SendError::ManagerStopped)?
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `status`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerStopped`] if the task exits first.
    pub async fn wait_for_status(
        &self,
        status: ConnectionStatus,
    ) -> Result<ConnectionState, ManagerStopped> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|state| state.status == status)
            .await
            .map_err(|_| ManagerStopped)?;
        Ok(state.clone())
    }

    /// Close the connection and stop the task.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

type OpenFuture<T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send>>;

/// What woke the task up.
enum Step<T> {
    Command(Option<Command>),
    Opened(Result<T, TransportError>),
    Inbound(Result<String, TransportError>),
    InactivityElapsed,
    AckDeadline,
}

/// The connection task. Create it with [`ConnectionManager::spawn`].
pub struct ConnectionManager<C: Connector> {
    connector: C,
    config: ConnectionConfig,
    identity: SessionIdentity,
    status: ConnectionStatus,
    transport: Option<C::Transport>,
    opening: Option<OpenFuture<C::Transport>>,
    inactivity_deadline: Option<Instant>,
    acks: PendingAckTable,
    dedup: ProcessedFrameCache,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::Sender<SessionEvent>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Spawn the connection task.
    ///
    /// Returns the handle used to drive it and the receiver of
    /// [`SessionEvent`]s. The task runs until [`ConnectionHandle::shutdown`]
    /// is called or every handle is dropped.
    pub fn spawn(
        connector: C,
        identity: SessionIdentity,
        config: ConnectionConfig,
    ) -> (ConnectionHandle, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::initial(identity.client_id().clone()));

        let manager = Self {
            connector,
            acks: PendingAckTable::new(config.ack_timeout),
            dedup: ProcessedFrameCache::new(config.dedup_capacity),
            config,
            identity,
            status: ConnectionStatus::Disconnected,
            transport: None,
            opening: None,
            inactivity_deadline: None,
            cmd_rx,
            state_tx,
            events: event_tx,
        };
        tokio::spawn(manager.run());

        (ConnectionHandle { cmd_tx, state_rx }, event_rx)
    }

    async fn run(mut self) {
        tracing::debug!(client_id = %self.identity.client_id(), "connection task started");
        loop {
            let inactivity = self.inactivity_deadline;
            let ack_deadline = self.acks.next_deadline();

            let step = tokio::select! {
                cmd = self.cmd_rx.recv() => Step::Command(cmd),
                opened = open_from(&mut self.opening) => Step::Opened(opened),
                inbound = recv_from(self.transport.as_ref()) => Step::Inbound(inbound),
                () = sleep_until_opt(inactivity) => Step::InactivityElapsed,
                () = sleep_until_opt(ack_deadline) => Step::AckDeadline,
            };

            match step {
                Step::Command(Some(Command::Connect)) => self.handle_connect().await,
                Step::Command(Some(Command::Disconnect { done })) => {
                    tracing::info!("disconnect requested");
                    self.teardown(None).await;
                    let _ = done.send(());
                }
                Step::Command(Some(Command::Send { message, reply })) => {
                    let result = self.handle_send(message).await;
                    let _ = reply.send(result);
                }
                Step::Command(Some(Command::Shutdown) | None) => {
                    self.teardown(None).await;
                    break;
                }
                Step::Opened(result) => self.handle_opened(result).await,
                Step::Inbound(Ok(text)) => self.handle_inbound(&text).await,
                Step::Inbound(Err(e)) => self.handle_transport_lost(&e).await,
                Step::InactivityElapsed => {
                    tracing::warn!(
                        timeout_secs = self.config.inactivity_timeout.as_secs(),
                        "no ping from backend, closing session"
                    );
                    self.teardown(Some(SESSION_INACTIVE)).await;
                }
                Step::AckDeadline => {
                    for message_id in self.acks.expire(Instant::now()) {
                        tracing::warn!(message_id = %message_id, "confirmation timed out");
                    }
                }
            }
        }
        tracing::debug!("connection task exiting");
    }

    async fn handle_connect(&mut self) {
        if self.transport.is_some() || self.opening.is_some() {
            tracing::debug!(status = %self.status, "connect ignored, connection already exists");
            return;
        }
        tracing::info!("connecting");
        self.publish(ConnectionStatus::Connecting, None).await;

        let open = self.connector.connect();
        let timeout = self.config.connect_timeout;
        self.opening = Some(Box::pin(async move {
            tokio::time::timeout(timeout, open)
                .await
                .map_err(|_| TransportError::Timeout)?
        }));
    }

    async fn handle_opened(&mut self, result: Result<C::Transport, TransportError>) {
        self.opening = None;
        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(err = %e, "failed to open transport");
                self.teardown(Some(CONNECTION_FAILED)).await;
                return;
            }
        };

        let hello = Frame::connect(self.identity.client_id().clone());
        let sent = match codec::encode(&hello) {
            Ok(text) => transport.send(text).await.map_err(SendError::from),
            Err(e) => Err(SendError::from(e)),
        };
        self.transport = Some(transport);
        if let Err(e) = sent {
            tracing::warn!(err = %e, "failed to send connect frame");
            self.teardown(Some(CONNECTION_FAILED)).await;
            return;
        }
        tracing::debug!("transport open, awaiting connect_confirm");
    }

    async fn handle_transport_lost(&mut self, err: &TransportError) {
        let reason = match (err, self.status) {
            (TransportError::ConnectionClosed, ConnectionStatus::Connected) => SESSION_INACTIVE,
            _ => CONNECTION_FAILED,
        };
        tracing::warn!(err = %err, reason, "connection lost");
        self.teardown(Some(reason)).await;
    }

    /// Single entry point for inbound text.
    async fn handle_inbound(&mut self, text: &str) {
        let frame = match codec::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(err = %e, "dropping malformed frame");
                return;
            }
        };

        let key = FrameKey::for_frame(&frame);
        if let Some(key) = &key
            && self.dedup.contains(key)
        {
            tracing::debug!(key = %key, "dropping duplicate frame");
            return;
        }

        self.dispatch(frame).await;

        if let Some(key) = key {
            self.dedup.insert(key);
        }
    }

    async fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::ConnectConfirm(confirm) => {
                if !confirm.is_confirmed() {
                    tracing::warn!(status = %confirm.status, "connect_confirm not granted, ignoring");
                    return;
                }
                tracing::info!(conversation_id = %confirm.conversation_id, "session granted");
                self.identity.begin_conversation(confirm.conversation_id);
                self.inactivity_deadline =
                    Some(deadline_after(Instant::now(), self.config.inactivity_timeout));
                self.publish(ConnectionStatus::Connected, None).await;
            }
            Frame::Ping(_) => {
                self.inactivity_deadline =
                    Some(deadline_after(Instant::now(), self.config.inactivity_timeout));
                self.send_pong().await;
            }
            Frame::Confirm(confirm) => {
                if !self.acks.resolve(&confirm) {
                    tracing::debug!(message_id = %confirm.message_id, "confirm without pending send");
                }
                self.forward(Frame::Confirm(confirm)).await;
            }
            frame @ (Frame::Response(_)
            | Frame::ImageStatus(_)
            | Frame::Status(_)
            | Frame::Error(_)) => self.forward(frame).await,
            other @ (Frame::Connect(_) | Frame::Message(_) | Frame::Pong(_)) => {
                tracing::debug!(kind = %other.kind(), "ignoring unexpected frame kind");
            }
        }
    }

    async fn send_pong(&mut self) {
        let Some(transport) = &self.transport else {
            return;
        };
        let pong = Frame::pong(self.identity.client_id().clone());
        match codec::encode(&pong) {
            Ok(text) => {
                if let Err(e) = transport.send(text).await {
                    tracing::warn!(err = %e, "failed to send pong");
                }
            }
            Err(e) => tracing::warn!(err = %e, "failed to encode pong"),
        }
    }

    async fn handle_send(&mut self, message: OutboundMessage) -> Result<PendingConfirmation, SendError> {
        let (Some(transport), Some(conversation_id), ConnectionStatus::Connected) = (
            &self.transport,
            self.identity.conversation_id(),
            self.status,
        ) else {
            return Err(SendError::NotConnected);
        };

        let message_id = message.message_id.unwrap_or_else(MessageId::generate);
        let frame = Frame::Message(ChatMessage {
            message_id: message_id.clone(),
            conversation_id: conversation_id.clone(),
            client_id: self.identity.client_id().clone(),
            timestamp: Timestamp::now(),
            content: message.content,
            images: message.images,
        });
        let text = codec::encode(&frame)?;

        let pending = self.acks.register(message_id.clone(), Instant::now())?;
        if let Err(e) = transport.send(text).await {
            tracing::warn!(message_id = %message_id, err = %e, "failed to transmit message");
            self.acks.remove(&message_id);
            return Err(SendError::Transport(e));
        }
        tracing::debug!(message_id = %message_id, "message sent, awaiting confirm");
        Ok(pending)
    }

    async fn forward(&mut self, frame: Frame) {
        if self.events.send(SessionEvent::Frame(frame)).await.is_err() {
            tracing::debug!("event receiver dropped, frame discarded");
        }
    }

    /// Drop the transport and every piece of per-connection state, then
    /// publish `Disconnected` with `error`.
    async fn teardown(&mut self, error: Option<&str>) {
        self.opening = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.inactivity_deadline = None;
        let rejected = self.acks.reject_all();
        if rejected > 0 {
            tracing::debug!(rejected, "pending sends rejected");
        }
        self.dedup.clear();
        self.identity.end_conversation();

        let unchanged = self.status == ConnectionStatus::Disconnected
            && self.state_tx.borrow().error.as_deref() == error;
        if unchanged {
            return;
        }
        self.publish(ConnectionStatus::Disconnected, error.map(str::to_owned))
            .await;
    }

    async fn publish(&mut self, status: ConnectionStatus, error: Option<String>) {
        self.status = status;
        let state = ConnectionState {
            status,
            client_id: self.identity.client_id().clone(),
            conversation_id: self.identity.conversation_id().cloned(),
            error,
        };
        self.state_tx.send_replace(state.clone());
        let _ = self.events.send(SessionEvent::Connection(state)).await;
    }
}

async fn open_from<T>(opening: &mut Option<OpenFuture<T>>) -> Result<T, TransportError> {
    match opening {
        Some(open) => open.await,
        None => std::future::pending().await,
    }
}

async fn recv_from<T: Transport>(transport: Option<&T>) -> Result<String, TransportError> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

/// `now + timeout`, saturating to a far deadline instead of overflowing.
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chatlink_proto::frame::{Confirm, Response};

    use crate::transport::loopback::{LoopbackConnector, LoopbackPeer, LoopbackServer};

    const CONFIRM_SESSION: &str =
        r#"{"type":"connect_confirm","conversationId":"v1","status":"confirmed"}"#;

    struct Harness {
        handle: ConnectionHandle,
        events: mpsc::Receiver<SessionEvent>,
        connector: LoopbackConnector,
        server: LoopbackServer,
    }

    fn harness() -> Harness {
        harness_with(ConnectionConfig::default())
    }

    fn harness_with(config: ConnectionConfig) -> Harness {
        let (connector, server) = LoopbackConnector::new();
        let (handle, events) = ConnectionManager::spawn(
            connector.clone(),
            SessionIdentity::new(ClientId::new("c1")),
            config,
        );
        Harness {
            handle,
            events,
            connector,
            server,
        }
    }

    /// Connect, answer the handshake and wait for `Connected`.
    async fn establish(h: &mut Harness) -> LoopbackPeer {
        h.handle.connect().await.unwrap();
        let mut peer = h.server.accept().await.unwrap();
        let hello = peer.recv_frame().await.unwrap();
        assert!(matches!(hello, Frame::Connect(ref c) if c.client_id == ClientId::new("c1")));
        peer.send_text(CONFIRM_SESSION).await.unwrap();
        h.handle
            .wait_for_status(ConnectionStatus::Connected)
            .await
            .unwrap();
        peer
    }

    async fn next_frame(events: &mut mpsc::Receiver<SessionEvent>) -> Frame {
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Frame(frame) => return frame,
                SessionEvent::Connection(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn handshake_grants_conversation() {
        let mut h = harness();
        assert_eq!(h.handle.state().status, ConnectionStatus::Disconnected);

        let _peer = establish(&mut h).await;
        let state = h.handle.state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.conversation_id, Some(ConversationId::new("v1")));
        assert_eq!(state.client_id, ClientId::new("c1"));
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn unconfirmed_connect_confirm_is_ignored() {
        let mut h = harness();
        h.handle.connect().await.unwrap();
        let peer = h.server.accept().await.unwrap();
        peer.send_text(r#"{"type":"connect_confirm","conversationId":"v1","status":"rejected"}"#)
            .await
            .unwrap();
        peer.send_text(r#"{"type":"response","messageId":"r1","content":"x"}"#)
            .await
            .unwrap();
        // The response is processed after the rejected confirm.
        let _ = next_frame(&mut h.events).await;
        assert_eq!(h.handle.state().status, ConnectionStatus::Connecting);
        assert!(h.handle.state().conversation_id.is_none());
    }

    #[tokio::test]
    async fn second_connect_is_noop() {
        let mut h = harness();
        let _peer = establish(&mut h).await;
        h.handle.connect().await.unwrap();
        let accepted =
            tokio::time::timeout(Duration::from_millis(50), h.server.accept()).await;
        assert!(accepted.is_err(), "no second transport should be opened");
        assert_eq!(h.handle.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn refused_connect_reports_connection_failed() {
        let h = harness();
        h.connector.set_refuse(true);
        h.handle.connect().await.unwrap();
        let mut rx = h.handle.subscribe_state();
        let state = rx
            .wait_for(|s| s.status == ConnectionStatus::Disconnected && s.error.is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(state.error.as_deref(), Some(CONNECTION_FAILED));
    }

    #[tokio::test]
    async fn send_when_disconnected_fails_fast() {
        let h = harness();
        let err = h
            .handle
            .send(OutboundMessage::text("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[tokio::test]
    async fn send_stamps_frame_and_resolves_on_confirm() {
        let mut h = harness();
        let mut peer = establish(&mut h).await;

        let pending = h
            .handle
            .send(OutboundMessage::text("hello"))
            .await
            .unwrap();
        let Frame::Message(sent) = peer.recv_frame().await.unwrap() else {
            panic!("expected message frame");
        };
        assert_eq!(&sent.message_id, pending.message_id());
        assert_eq!(sent.conversation_id, ConversationId::new("v1"));
        assert_eq!(sent.client_id, ClientId::new("c1"));
        assert_eq!(sent.content.as_deref(), Some("hello"));

        peer.send_frame(&Frame::Confirm(Confirm {
            message_id: sent.message_id.clone(),
            status: "received".into(),
            client_id: None,
            timestamp: None,
        }))
        .await
        .unwrap();

        let confirmation = pending.await.unwrap();
        assert_eq!(confirmation.message_id, sent.message_id);

        // The confirm is also forwarded for the store.
        let forwarded = next_frame(&mut h.events).await;
        assert!(matches!(forwarded, Frame::Confirm(c) if c.message_id == sent.message_id));
    }

    #[tokio::test]
    async fn duplicate_pending_id_is_rejected() {
        let mut h = harness();
        let _peer = establish(&mut h).await;
        let id = MessageId::new("m1");
        let _first = h
            .handle
            .send(OutboundMessage::text("a").with_id(id.clone()))
            .await
            .unwrap();
        let err = h
            .handle
            .send(OutboundMessage::text("b").with_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::DuplicateMessageId(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_times_out_and_late_confirm_is_ignored() {
        let mut h = harness();
        let mut peer = establish(&mut h).await;
        let started = Instant::now();

        let pending = h
            .handle
            .send(OutboundMessage::text("hello"))
            .await
            .unwrap();
        let id = pending.message_id().clone();
        let _ = peer.recv_frame().await.unwrap();

        let err = pending.await.unwrap_err();
        assert!(matches!(err, SendError::ConfirmationTimeout));
        assert!(started.elapsed() >= DEFAULT_ACK_TIMEOUT);

        peer.send_text(format!(
            r#"{{"type":"confirm","messageId":"{id}","status":"received"}}"#
        ))
        .await
        .unwrap();
        let forwarded = next_frame(&mut h.events).await;
        assert!(matches!(forwarded, Frame::Confirm(_)));
        assert_eq!(h.handle.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let mut h = harness();
        let mut peer = establish(&mut h).await;
        peer.send_text(r#"{"type":"ping"}"#).await.unwrap();
        let reply = peer.recv_frame().await.unwrap();
        assert!(matches!(reply, Frame::Pong(p) if p.client_id == Some(ClientId::new("c1"))));
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_closes_session() {
        let mut h = harness();
        let _peer = establish(&mut h).await;
        let started = Instant::now();

        let state = h
            .handle
            .wait_for_status(ConnectionStatus::Disconnected)
            .await
            .unwrap();
        assert!(started.elapsed() >= DEFAULT_INACTIVITY_TIMEOUT);
        assert_eq!(state.error.as_deref(), Some(SESSION_INACTIVE));
        assert!(state.conversation_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_resets_inactivity_window() {
        let mut h = harness();
        let mut peer = establish(&mut h).await;
        let started = Instant::now();

        tokio::time::sleep(Duration::from_secs(100)).await;
        peer.send_text(r#"{"type":"ping"}"#).await.unwrap();
        let _pong = peer.recv_frame().await.unwrap();
        assert_eq!(h.handle.state().status, ConnectionStatus::Connected);

        h.handle
            .wait_for_status(ConnectionStatus::Disconnected)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(280));
    }

    #[tokio::test]
    async fn huge_timeouts_do_not_stop_the_task() {
        let mut h = harness_with(ConnectionConfig {
            connect_timeout: Duration::MAX,
            inactivity_timeout: Duration::from_secs(u64::MAX),
            ack_timeout: Duration::MAX,
            ..ConnectionConfig::default()
        });
        let mut peer = establish(&mut h).await;
        assert!(h.handle.state().is_connected());

        peer.send_text(r#"{"type":"ping"}"#).await.unwrap();
        assert!(matches!(peer.recv_frame().await.unwrap(), Frame::Pong(_)));

        let pending = h
            .handle
            .send(OutboundMessage::text("still here"))
            .await
            .unwrap();
        let Frame::Message(sent) = peer.recv_frame().await.unwrap() else {
            panic!("expected message frame");
        };
        peer.send_frame(&Frame::Confirm(Confirm {
            message_id: sent.message_id.clone(),
            status: "received".into(),
            client_id: None,
            timestamp: None,
        }))
        .await
        .unwrap();
        assert_eq!(pending.await.unwrap().message_id, sent.message_id);
        assert!(h.handle.state().is_connected());
    }

    #[test]
    fn deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(
            deadline_after(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
        assert!(deadline_after(now, Duration::MAX) >= now + FAR_FUTURE);
    }

    #[tokio::test]
    async fn repeated_status_transitions_are_all_forwarded() {
        let mut h = harness();
        let peer = establish(&mut h).await;
        for status in ["thinking", "idle", "thinking"] {
            peer.send_text(format!(
                r#"{{"type":"status","messageId":"m1","status":"{status}"}}"#
            ))
            .await
            .unwrap();
        }
        for expected in ["thinking", "idle", "thinking"] {
            let Frame::Status(update) = next_frame(&mut h.events).await else {
                panic!("expected status frame");
            };
            assert_eq!(update.status.as_str(), expected);
        }
    }

    #[tokio::test]
    async fn duplicate_response_is_forwarded_once() {
        let mut h = harness();
        let peer = establish(&mut h).await;
        let r1 = r#"{"type":"response","messageId":"r1","content":"hi"}"#;
        peer.send_text(r1).await.unwrap();
        peer.send_text(r1).await.unwrap();
        peer.send_text(r#"{"type":"response","messageId":"r2","content":"again"}"#)
            .await
            .unwrap();

        let first = next_frame(&mut h.events).await;
        let second = next_frame(&mut h.events).await;
        assert!(matches!(first, Frame::Response(Response { ref message_id, .. }) if message_id.as_str() == "r1"));
        assert!(matches!(second, Frame::Response(Response { ref message_id, .. }) if message_id.as_str() == "r2"));
    }

    #[tokio::test]
    async fn image_pipeline_frames_all_pass_dedup() {
        let mut h = harness();
        let peer = establish(&mut h).await;
        for status in ["received", "processing", "analyzed"] {
            peer.send_text(format!(
                r#"{{"type":"image_status","messageId":"m1","imageId":"i1","status":"{status}"}}"#
            ))
            .await
            .unwrap();
        }
        for _ in 0..3 {
            assert!(matches!(next_frame(&mut h.events).await, Frame::ImageStatus(_)));
        }
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let mut h = harness();
        let peer = establish(&mut h).await;
        peer.send_text("not json").await.unwrap();
        peer.send_text(r#"{"type":"status","messageId":"m1","status":"thinking"}"#)
            .await
            .unwrap();
        assert!(matches!(next_frame(&mut h.events).await, Frame::Status(_)));
        assert_eq!(h.handle.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn disconnect_rejects_pending_and_clears_session() {
        let mut h = harness();
        let mut peer = establish(&mut h).await;
        let pending = h
            .handle
            .send(OutboundMessage::text("hello"))
            .await
            .unwrap();
        let _ = peer.recv_frame().await.unwrap();

        h.handle.disconnect().await.unwrap();
        assert!(matches!(pending.await, Err(SendError::Disconnected)));

        let state = h.handle.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.conversation_id.is_none());
        assert!(state.error.is_none());
        assert!(peer.recv_frame().await.is_none(), "transport should be closed");
    }

    #[tokio::test]
    async fn reconnect_reuses_client_id_and_resets_dedup() {
        let mut h = harness();
        let peer = establish(&mut h).await;
        let r1 = r#"{"type":"response","messageId":"r1","content":"hi"}"#;
        peer.send_text(r1).await.unwrap();
        let _ = next_frame(&mut h.events).await;

        h.handle.disconnect().await.unwrap();
        let peer = establish(&mut h).await;
        peer.send_text(r1).await.unwrap();
        let again = next_frame(&mut h.events).await;
        assert!(matches!(again, Frame::Response(_)));
    }

    #[tokio::test]
    async fn server_close_reports_inactivity() {
        let mut h = harness();
        let peer = establish(&mut h).await;
        peer.close();
        let state = h
            .handle
            .wait_for_status(ConnectionStatus::Disconnected)
            .await
            .unwrap();
        assert_eq!(state.error.as_deref(), Some(SESSION_INACTIVE));
    }

    #[tokio::test]
    async fn transport_failure_reports_connection_failed() {
        let mut h = harness();
        let peer = establish(&mut h).await;
        peer.fail().await;
        let state = h
            .handle
            .wait_for_status(ConnectionStatus::Disconnected)
            .await
            .unwrap();
        assert_eq!(state.error.as_deref(), Some(CONNECTION_FAILED));
    }

    #[tokio::test]
    async fn shutdown_stops_task() {
        let h = harness();
        h.handle.shutdown().await;
        let err = h
            .handle
            .wait_for_status(ConnectionStatus::Connected)
            .await
            .unwrap_err();
        assert_eq!(err, ManagerStopped);
    }
}
