//! Reconciled conversation state.
//!
//! [`MessageStore`] is the single source of truth the UI reads. It applies
//! local intents (optimistic inserts, typing, errors, email) and inbound
//! frames forwarded by the connection task, and writes every change to
//! messages or email through a [`StateStore`].
//!
//! Persistence is best effort: a failed save is logged and surfaced as the
//! last error, and the in-memory state is kept.

pub mod model;
pub mod persist;

use chatlink_proto::frame::Frame;
use chatlink_proto::message::{ImageStatus, MessageId};
use tokio::sync::{Mutex, watch};

pub use model::{ImageStatusEntry, Message, MessageKind, MessageStatus};
pub use persist::{FileStateStore, InMemoryStateStore, PersistError, PersistedState, StateStore};

/// Error shown when a change could not be saved.
pub const SAVE_FAILED: &str = "Failed to save message";

/// Error shown when stored history could not be loaded.
pub const LOAD_FAILED: &str = "Failed to load messages";

/// Error shown when clearing history could not be saved.
pub const CLEAR_FAILED: &str = "Failed to clear messages";

/// Everything the UI renders, apart from the connection itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    /// Conversation, oldest first.
    pub messages: Vec<Message>,
    /// The assistant is composing a reply.
    pub is_typing: bool,
    /// Last error to show, if any.
    pub error: Option<String>,
    /// Email left by the user.
    pub email: Option<String>,
    /// Whether to ask the user for an email.
    pub show_email_prompt: bool,
}

impl ChatState {
    /// Message with id `id`.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    fn persisted(&self) -> PersistedState {
        PersistedState {
            messages: self.messages.clone(),
            email: self.email.clone(),
        }
    }
}

/// Whether `email` looks like `local@domain.tld`.
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !host.is_empty() && !tld.is_empty() && !host.starts_with('.')
}

/// Reconciles and persists the conversation.
pub struct MessageStore<S: StateStore> {
    state: watch::Sender<ChatState>,
    persistence: S,
    save_lock: Mutex<()>,
}

impl<S: StateStore> MessageStore<S> {
    /// Create an empty store writing through `persistence`.
    pub fn new(persistence: S) -> Self {
        let (state, _) = watch::channel(ChatState::default());
        Self {
            state,
            persistence,
            save_lock: Mutex::new(()),
        }
    }

    /// Replace messages and email with the persisted copy.
    ///
    /// On failure the current state is kept and [`LOAD_FAILED`] is shown.
    pub async fn load(&self) {
        match self.persistence.load().await {
            Ok(persisted) => {
                tracing::debug!(messages = persisted.messages.len(), "loaded stored conversation");
                self.state.send_modify(|state| {
                    state.messages = persisted.messages;
                    state.email = persisted.email;
                });
            }
            Err(e) => {
                tracing::warn!(err = %e, "failed to load stored conversation");
                self.set_error(LOAD_FAILED);
            }
        }
    }

    /// Append `message`. A message whose id is already present is ignored.
    pub async fn add_message(&self, message: Message) {
        let added = self.state.send_if_modified(|state| {
            if state.message(&message.id).is_some() {
                tracing::debug!(message_id = %message.id, "message already present");
                return false;
            }
            state.messages.push(message);
            true
        });
        if added {
            self.persist(SAVE_FAILED).await;
        }
    }

    /// Merge `update` into the status of message `id`. Unknown ids are
    /// ignored.
    pub async fn update_message_status(&self, id: &MessageId, update: MessageStatus) {
        let changed = self.state.send_if_modified(|state| {
            let Some(message) = state.message_mut(id) else {
                return false;
            };
            let merged = message.status.merge(update);
            if merged == message.status {
                return false;
            }
            message.status = merged;
            true
        });
        if changed {
            self.persist(SAVE_FAILED).await;
        }
    }

    /// Record `status` for image `image_id` of message `message_id`.
    /// Unknown messages are ignored.
    pub async fn update_image_status(
        &self,
        message_id: &MessageId,
        image_id: &str,
        status: ImageStatus,
    ) {
        let changed = self.state.send_if_modified(|state| {
            state
                .message_mut(message_id)
                .is_some_and(|message| message.upsert_image_status(image_id, status))
        });
        if changed {
            self.persist(SAVE_FAILED).await;
        } else {
            tracing::trace!(message_id = %message_id, image_id, "image status not applied");
        }
    }

    /// Apply an inbound application frame.
    pub async fn handle_response(&self, frame: &Frame) {
        match frame {
            Frame::Confirm(confirm) => {
                self.update_message_status(&confirm.message_id, MessageStatus::PROCESSED)
                    .await;
            }
            Frame::ImageStatus(update) => {
                self.update_image_status(&update.message_id, &update.image_id, update.status)
                    .await;
            }
            Frame::Status(update) => self.set_typing(update.status.is_busy()),
            Frame::Response(response) => {
                let added = self.state.send_if_modified(|state| {
                    if state.message(&response.message_id).is_some() {
                        return false;
                    }
                    state.messages.push(Message::assistant(response));
                    state.is_typing = false;
                    true
                });
                if added {
                    self.persist(SAVE_FAILED).await;
                } else {
                    tracing::debug!(message_id = %response.message_id, "response already present");
                }
            }
            Frame::Error(err) => {
                tracing::warn!(error = %err.error, "backend reported an error");
                self.state.send_modify(|state| {
                    state.error = Some(err.error.clone());
                    state.is_typing = false;
                });
            }
            other => tracing::debug!(kind = %other.kind(), "frame not handled by store"),
        }
    }

    /// Remove every message.
    pub async fn clear_messages(&self) {
        self.state.send_modify(|state| state.messages.clear());
        self.persist(CLEAR_FAILED).await;
    }

    /// Show or hide the typing indicator.
    pub fn set_typing(&self, typing: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_typing != typing;
            state.is_typing = typing;
            changed
        });
    }

    /// Show `error`.
    pub fn set_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.state.send_modify(|state| state.error = Some(error));
    }

    /// Hide the last error.
    pub fn clear_error(&self) {
        self.state.send_if_modified(|state| state.error.take().is_some());
    }

    /// Ask the user for an email.
    pub fn show_email_prompt(&self) {
        self.state.send_if_modified(|state| {
            let changed = !state.show_email_prompt;
            state.show_email_prompt = true;
            changed
        });
    }

    /// Stop asking for an email.
    pub fn dismiss_email_prompt(&self) {
        self.state.send_if_modified(|state| {
            let changed = state.show_email_prompt;
            state.show_email_prompt = false;
            changed
        });
    }

    /// Store `email` (already validated) and hide the prompt.
    pub async fn set_email(&self, email: impl Into<String>) {
        let email = email.into();
        self.state.send_modify(|state| {
            state.email = Some(email);
            state.show_email_prompt = false;
        });
        self.persist(SAVE_FAILED).await;
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    /// Save the latest state. Saves are serialised, and each one writes
    /// whatever is current when it gets the lock.
    async fn persist(&self, failure: &str) {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.state.borrow().persisted();
        if let Err(e) = self.persistence.save(&snapshot).await {
            tracing::warn!(err = %e, "failed to persist conversation");
            self.set_error(failure);
        }
    }
}
