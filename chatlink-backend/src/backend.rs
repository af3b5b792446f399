//! Backend core: shared state, WebSocket handler and the per-session
//! protocol.
//!
//! Each accepted WebSocket must open with a `connect` frame. The backend
//! answers with `connect_confirm` carrying a fresh conversation id, then
//! handles `message` frames until the socket closes:
//!
//! 1. `confirm` (status `received`)
//! 2. `status` `thinking`
//! 3. `image_status` `received` / `processing` / `analyzed` per image
//! 4. `response` after the configured reply delay
//! 5. `status` `idle`
//!
//! A `ping` goes out every ping interval. When an idle timeout is set, a
//! session that sends no message for that long is closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chatlink_proto::codec;
use chatlink_proto::frame::{
    CONFIRM_RECEIVED, CONNECT_CONFIRMED, ChatMessage, Confirm, ConnectConfirm, Frame,
    ImageStatusUpdate, Response, ServerError, StatusUpdate,
};
use chatlink_proto::message::{
    ActivityStatus, ClientId, ConversationId, ImageStatus, MessageId, Timestamp,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;

/// Default interval between server pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default pause between acknowledging a message and replying to it.
pub const DEFAULT_REPLY_DELAY: Duration = Duration::from_millis(500);

/// Error sent for a message with neither content nor images.
pub const EMPTY_MESSAGE_ERROR: &str = "Message must carry content or images";

/// Error sent for a message addressed to another conversation.
pub const UNKNOWN_CONVERSATION_ERROR: &str = "Unknown conversation";

/// Error sent for a frame that could not be parsed.
pub const MALFORMED_FRAME_ERROR: &str = "Malformed frame";

/// Activity reported while a reply is being prepared.
const THINKING: &str = "thinking";

/// Timing knobs applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Interval between pings; `None` disables pings.
    pub ping_interval: Option<Duration>,
    /// Pause before the reply to each message.
    pub reply_delay: Duration,
    /// Close sessions that send no message for this long; `None` never does.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            reply_delay: DEFAULT_REPLY_DELAY,
            idle_timeout: None,
        }
    }
}

/// Shared backend state holding the session registry.
pub struct BackendState {
    /// Maps conversation id to a channel sender for the session's writer.
    sessions: RwLock<HashMap<ConversationId, mpsc::UnboundedSender<Message>>>,
    settings: SessionSettings,
}

impl Default for BackendState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendState {
    /// Creates a backend state with default session settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    /// Creates a backend state with custom session settings.
    #[must_use]
    pub fn with_settings(settings: SessionSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// The settings applied to new sessions.
    #[must_use]
    pub const fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Registers a session, storing the sender half of its writer channel.
    pub async fn register(
        &self,
        conversation_id: &ConversationId,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(conversation_id.clone(), sender)
    }

    /// Removes a session, returning its sender if it existed.
    pub async fn unregister(
        &self,
        conversation_id: &ConversationId,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(conversation_id)
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Send a WebSocket Close frame to every live session.
    ///
    /// Clients see a clean close, the same as an idle session ending.
    pub async fn close_all_connections(&self) {
        let sessions = self.sessions.read().await;
        for (conversation_id, sender) in sessions.iter() {
            tracing::info!(conversation_id = %conversation_id, "sending close frame to session");
            let _ = sender.send(Message::Close(None));
        }
    }
}

/// Frames queued for one session's writer task.
#[derive(Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
    client_id: ClientId,
}

impl Outbox {
    /// Queue `frame`; returns `false` once the session is gone.
    fn push(&self, frame: &Frame) -> bool {
        let text = match codec::encode(frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, kind = ?frame.kind(), "failed to encode frame");
                return true;
            }
        };
        self.tx.send(Message::Text(text.into())).is_ok()
    }

    fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }

    fn confirm(&self, message_id: &MessageId) -> bool {
        self.push(&Frame::Confirm(Confirm {
            message_id: message_id.clone(),
            status: CONFIRM_RECEIVED.to_string(),
            client_id: Some(self.client_id.clone()),
            timestamp: Some(Timestamp::now()),
        }))
    }

    fn status(&self, message_id: &MessageId, status: &str) -> bool {
        self.push(&Frame::Status(StatusUpdate {
            message_id: message_id.clone(),
            status: ActivityStatus::new(status),
            client_id: Some(self.client_id.clone()),
            timestamp: Some(Timestamp::now()),
        }))
    }

    fn image_status(&self, message_id: &MessageId, image_id: &str, status: ImageStatus) -> bool {
        self.push(&Frame::ImageStatus(ImageStatusUpdate {
            message_id: message_id.clone(),
            image_id: image_id.to_string(),
            status,
            client_id: Some(self.client_id.clone()),
            timestamp: Some(Timestamp::now()),
        }))
    }

    fn response(&self, reply_to: &MessageId, content: String) -> bool {
        self.push(&Frame::Response(Response {
            message_id: MessageId::generate(),
            reply_to: Some(reply_to.clone()),
            content,
            client_id: Some(self.client_id.clone()),
            timestamp: Some(Timestamp::now()),
        }))
    }

    fn error(&self, error: &str) -> bool {
        self.push(&Frame::Error(ServerError {
            error: error.to_string(),
            client_id: Some(self.client_id.clone()),
            timestamp: Some(Timestamp::now()),
        }))
    }
}

/// Handles an upgraded WebSocket connection for a single session.
///
/// The connection lifecycle:
/// 1. Wait for a `connect` frame.
/// 2. Register a new conversation and send `connect_confirm`.
/// 3. Start the pinger, if enabled.
/// 4. Enter the read loop, answering each message.
/// 5. On disconnect, unregister the conversation.
pub async fn handle_socket(socket: WebSocket, state: Arc<BackendState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(client_id) = wait_for_connect(&mut ws_receiver).await else {
        tracing::warn!("connection closed before connect");
        return;
    };

    let conversation_id = ConversationId::new(uuid::Uuid::new_v4().to_string());
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.register(&conversation_id, tx.clone()).await;

    let outbox = Outbox { tx, client_id };
    let grant = Frame::ConnectConfirm(ConnectConfirm {
        conversation_id: conversation_id.clone(),
        status: CONNECT_CONFIRMED.to_string(),
        client_id: Some(outbox.client_id.clone()),
        timestamp: Some(Timestamp::now()),
    });
    outbox.push(&grant);

    tracing::info!(
        conversation_id = %conversation_id,
        client_id = %outbox.client_id,
        "session granted"
    );

    let writer_conversation = conversation_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conversation_id = %writer_conversation, "WebSocket write failed");
                break;
            }
        }
    });

    let settings = state.settings();
    let ping_task = settings
        .ping_interval
        .map(|period| tokio::spawn(ping_loop(outbox.clone(), period)));

    let reader_conversation = conversation_id.clone();
    let mut read_task = tokio::spawn(async move {
        read_loop(ws_receiver, outbox, reader_conversation, settings).await;
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }
    if let Some(ping_task) = ping_task {
        ping_task.abort();
    }

    state.unregister(&conversation_id).await;
    tracing::info!(conversation_id = %conversation_id, "session ended");
}

/// Waits for the opening `connect` frame and returns the client id.
///
/// Returns `None` if the connection closes or any other frame arrives first.
async fn wait_for_connect(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<ClientId> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match codec::decode(text.as_str()) {
                Ok(Frame::Connect(connect)) => {
                    if connect.client_id.as_str().is_empty() {
                        tracing::warn!("received connect with empty client id");
                        return None;
                    }
                    return Some(connect.client_id);
                }
                Ok(other) => {
                    tracing::warn!(kind = ?other.kind(), "expected connect, got different frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode connect frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Reads frames from the client until the socket closes.
async fn read_loop(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    outbox: Outbox,
    conversation_id: ConversationId,
    settings: SessionSettings,
) {
    let mut idle_deadline = settings.idle_timeout.map(|t| Instant::now() + t);

    loop {
        let next = tokio::select! {
            next = receiver.next() => next,
            () = sleep_until_opt(idle_deadline) => {
                tracing::info!(conversation_id = %conversation_id, "session idle, closing");
                outbox.close();
                idle_deadline = None;
                continue;
            }
        };
        let Some(Ok(msg)) = next else {
            break;
        };

        match msg {
            Message::Text(text) => match codec::decode(text.as_str()) {
                Ok(Frame::Message(message)) => {
                    if message.conversation_id != conversation_id {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            claimed = %message.conversation_id,
                            "message for another conversation"
                        );
                        outbox.error(UNKNOWN_CONVERSATION_ERROR);
                        continue;
                    }
                    if let Some(timeout) = settings.idle_timeout {
                        idle_deadline = Some(Instant::now() + timeout);
                    }
                    tokio::spawn(respond(message, outbox.clone(), settings.reply_delay));
                }
                Ok(Frame::Pong(_)) => {
                    tracing::trace!(conversation_id = %conversation_id, "pong");
                }
                Ok(other) => {
                    tracing::debug!(kind = ?other.kind(), "ignoring frame");
                }
                Err(e) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "bad frame");
                    outbox.error(MALFORMED_FRAME_ERROR);
                }
            },
            Message::Close(_) => {
                tracing::info!(conversation_id = %conversation_id, "received close frame");
                break;
            }
            _ => {}
        }
    }
}

/// Answers one message: confirm, progress, reply.
async fn respond(message: ChatMessage, outbox: Outbox, reply_delay: Duration) {
    let message_id = &message.message_id;
    if !outbox.confirm(message_id) {
        return;
    }

    let Some(reply) = reply_text(&message) else {
        outbox.error(EMPTY_MESSAGE_ERROR);
        return;
    };

    outbox.status(message_id, THINKING);
    for index in 1..=message.images.len() {
        let image_id = format!("img-{index}");
        for status in [ImageStatus::Received, ImageStatus::Processing, ImageStatus::Analyzed] {
            if !outbox.image_status(message_id, &image_id, status) {
                return;
            }
        }
    }

    tokio::time::sleep(reply_delay).await;

    if outbox.response(message_id, reply) {
        outbox.status(message_id, ActivityStatus::IDLE);
    }
}

/// The reply text for `message`, or `None` if it carries nothing.
fn reply_text(message: &ChatMessage) -> Option<String> {
    let text = message
        .content
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());
    match (text, message.images.len()) {
        (None, 0) => None,
        (Some(text), 0) => Some(format!("You said: {text}")),
        (Some(text), n) => Some(format!("You said: {text} ({n} image(s) analyzed)")),
        (None, n) => Some(format!("{n} image(s) analyzed")),
    }
}

/// Sends a `ping` every `period` until the session is gone.
async fn ping_loop(outbox: Outbox, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if !outbox.push(&Frame::ping()) {
            break;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Starts the backend on the given address with default settings and
/// returns the bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BackendState::new())).await
}

/// Starts the backend with a pre-configured [`BackendState`].
///
/// Use [`BackendState::with_settings`] to apply the timing from the
/// resolved [`crate::config::BackendConfig`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BackendState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "backend server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<BackendState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
