//! The chat client context object.
//!
//! [`ChatClient`] wires a [`ConnectionManager`] to a [`MessageStore`]: it
//! owns the store, holds a handle to the connection task, and runs an
//! event pump that applies every [`SessionEvent`] to the store. UIs drive
//! it through `send_message`, `connect` and `disconnect`, and read
//! [`ChatSnapshot`]s or subscribe to changes.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chatlink_proto::message::{ClientId, ImageData, MessageId};

use crate::connection::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus,
    ManagerStopped, OutboundMessage, PendingConfirmation, SESSION_INACTIVE, SendError,
    SessionEvent,
};
use crate::session::{IdentityError, SessionIdentity};
use crate::store::{ChatState, Message, MessageStore, StateStore, is_valid_email};
use crate::transport::Connector;

/// Error shown when the user tries to send nothing.
pub const EMPTY_MESSAGE: &str = "Message cannot be empty";

/// Error shown when the user sends without a session.
pub const NOT_CONNECTED: &str = "Not connected to chat server";

/// Error shown when a message could not be transmitted.
pub const SEND_FAILED: &str = "Failed to send message";

/// Error shown when the entered email is not usable.
pub const INVALID_EMAIL: &str = "Please enter a valid email address";

/// Errors returned by [`ChatClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Neither text nor images were given.
    #[error("message cannot be empty")]
    EmptyMessage,

    /// No session is granted.
    #[error("not connected to chat server")]
    NotConnected,

    /// The email does not look like `local@domain.tld`.
    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    /// The send pipeline failed.
    #[error("send failed: {0}")]
    Send(#[from] SendError),

    /// The client identity could not be loaded.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

impl From<ManagerStopped> for ClientError {
    fn from(stopped: ManagerStopped) -> Self {
        Self::Send(stopped.into())
    }
}

/// Everything a UI needs to render one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    /// Conversation, typing, error and email prompt.
    pub chat: ChatState,
    /// Connection status and session ids.
    pub connection: ConnectionState,
}

/// A running chat client.
pub struct ChatClient<S: StateStore> {
    store: Arc<MessageStore<S>>,
    connection: ConnectionHandle,
    client_id: ClientId,
    pump: JoinHandle<()>,
}

impl<S: StateStore> ChatClient<S> {
    /// Load stored state, spawn the connection task and the event pump.
    ///
    /// The client starts disconnected; call [`connect`](Self::connect).
    pub async fn start<C: Connector>(
        connector: C,
        identity: SessionIdentity,
        persistence: S,
        config: ConnectionConfig,
    ) -> Self {
        let store = Arc::new(MessageStore::new(persistence));
        store.load().await;

        let client_id = identity.client_id().clone();
        let (connection, events) = ConnectionManager::spawn(connector, identity, config);
        let pump = tokio::spawn(run_event_pump(Arc::clone(&store), events));
        tracing::info!(client_id = %client_id, "chat client started");

        Self {
            store,
            connection,
            client_id,
            pump,
        }
    }

    /// Start connecting to the backend.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Send`] if the connection task has stopped.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await?;
        Ok(())
    }

    /// Close the connection. Pending sends fail with
    /// [`SendError::Disconnected`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Send`] if the connection task has stopped.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.connection.disconnect().await?;
        self.store.set_typing(false);
        Ok(())
    }

    /// Wait until the connection reaches `status`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Send`] if the connection task stops first.
    pub async fn wait_for_status(
        &self,
        status: ConnectionStatus,
    ) -> Result<ConnectionState, ClientError> {
        Ok(self.connection.wait_for_status(status).await?)
    }

    /// Send a message with optional images.
    ///
    /// The message is added to the store first (status `sent`), then
    /// transmitted. On success the typing indicator is lit and the returned
    /// future resolves when the backend confirms.
    ///
    /// # Errors
    ///
    /// - [`ClientError::EmptyMessage`] if there is neither text nor an image.
    /// - [`ClientError::NotConnected`] without a session.
    /// - [`ClientError::Send`] if transmitting failed.
    pub async fn send_message(
        &self,
        content: &str,
        images: Vec<ImageData>,
    ) -> Result<PendingConfirmation, ClientError> {
        let content = content.trim();
        if content.is_empty() && images.is_empty() {
            self.store.set_error(EMPTY_MESSAGE);
            return Err(ClientError::EmptyMessage);
        }
        if !self.connection.state().is_connected() {
            self.store.set_error(NOT_CONNECTED);
            return Err(ClientError::NotConnected);
        }

        let message_id = MessageId::generate();
        let payloads = images.iter().map(|image| image.data.clone()).collect();
        self.store
            .add_message(Message::user(
                message_id.clone(),
                content,
                payloads,
                self.client_id.clone(),
            ))
            .await;

        let outbound = OutboundMessage {
            message_id: Some(message_id),
            content: (!content.is_empty()).then(|| content.to_owned()),
            images,
        };
        match self.connection.send(outbound).await {
            Ok(pending) => {
                self.store.clear_error();
                self.store.set_typing(true);
                Ok(pending)
            }
            Err(SendError::NotConnected) => {
                self.store.set_error(NOT_CONNECTED);
                Err(ClientError::NotConnected)
            }
            Err(e) => {
                tracing::warn!(err = %e, "send failed");
                self.store.set_error(SEND_FAILED);
                Err(ClientError::Send(e))
            }
        }
    }

    /// Remove every message. The connection is not touched.
    pub async fn clear_messages(&self) {
        self.store.clear_messages().await;
    }

    /// Store the user's email and hide the prompt.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidEmail`] if `email` is not of the form
    /// `local@domain.tld`; nothing is stored.
    pub async fn set_email(&self, email: &str) -> Result<(), ClientError> {
        let email = email.trim();
        if !is_valid_email(email) {
            self.store.set_error(INVALID_EMAIL);
            return Err(ClientError::InvalidEmail(email.to_owned()));
        }
        self.store.clear_error();
        self.store.set_email(email).await;
        Ok(())
    }

    /// Hide the email prompt without storing anything.
    pub fn dismiss_email_prompt(&self) {
        self.store.dismiss_email_prompt();
    }

    /// Hide the last error.
    pub fn clear_error(&self) {
        self.store.clear_error();
    }

    /// Current state for rendering.
    #[must_use]
    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            chat: self.store.snapshot(),
            connection: self.connection.state(),
        }
    }

    /// Receiver that observes every change of the conversation state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.store.subscribe()
    }

    /// Receiver that observes every connection state change.
    #[must_use]
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// The durable client id.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Close the connection, stop the connection task and wait for the
    /// event pump to drain.
    pub async fn shutdown(self) {
        self.connection.shutdown().await;
        drop(self.connection);
        if let Err(e) = self.pump.await {
            tracing::warn!(err = %e, "event pump task failed");
        }
        tracing::info!("chat client stopped");
    }
}

/// Apply session events to the store until the connection task exits.
async fn run_event_pump<S: StateStore>(
    store: Arc<MessageStore<S>>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Frame(frame) => store.handle_response(&frame).await,
            SessionEvent::Connection(state) => apply_connection_state(&store, &state),
        }
    }
    tracing::debug!("event pump exiting");
}

fn apply_connection_state<S: StateStore>(store: &MessageStore<S>, state: &ConnectionState) {
    match state.status {
        ConnectionStatus::Connected => store.clear_error(),
        ConnectionStatus::Connecting => {}
        ConnectionStatus::Disconnected => {
            store.set_typing(false);
            let Some(error) = &state.error else {
                return;
            };
            store.set_error(error.clone());
            if error == SESSION_INACTIVE && store.snapshot().email.is_none() {
                store.show_email_prompt();
            }
        }
    }
}
