//! Outbound messages awaiting a server `confirm`.
//!
//! Every sent message registers a [`PendingAck`] with a deadline. A matching
//! confirm resolves it; the deadline, or a disconnect, fails it. The table
//! is owned by the connection task and is never shared.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use chatlink_proto::frame::Confirm;
use chatlink_proto::message::{MessageId, Timestamp};

use super::{SendError, deadline_after};

/// Default time allowed for a `confirm` to arrive.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Successful outcome of a send: the server confirmed receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// The confirmed message.
    pub message_id: MessageId,
    /// Status reported by the server (normally `received`).
    pub status: String,
    /// Server timestamp, if it sent one.
    pub timestamp: Option<Timestamp>,
}

impl From<&Confirm> for Confirmation {
    fn from(confirm: &Confirm) -> Self {
        Self {
            message_id: confirm.message_id.clone(),
            status: confirm.status.clone(),
            timestamp: confirm.timestamp.clone(),
        }
    }
}

/// One outstanding send.
#[derive(Debug)]
pub struct PendingAck {
    /// Id of the sent message.
    pub message_id: MessageId,
    /// When the message was handed to the transport.
    pub created_at: Instant,
    /// When the send fails with [`SendError::ConfirmationTimeout`].
    pub deadline: Instant,
    completion: oneshot::Sender<Result<Confirmation, SendError>>,
}

/// Resolves once the server confirms the message, or the send fails.
///
/// Returned by [`ConnectionHandle::send`](super::ConnectionHandle::send)
/// after the frame has been transmitted.
#[derive(Debug)]
pub struct PendingConfirmation {
    message_id: MessageId,
    rx: oneshot::Receiver<Result<Confirmation, SendError>>,
}

impl PendingConfirmation {
    /// Id assigned to the sent message.
    #[must_use]
    pub const fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

impl Future for PendingConfirmation {
    type Output = Result<Confirmation, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(SendError::ManagerStopped)))
    }
}

/// Table of [`PendingAck`]s keyed by message id.
#[derive(Debug)]
pub struct PendingAckTable {
    entries: HashMap<MessageId, PendingAck>,
    timeout: Duration,
}

impl PendingAckTable {
    /// Create a table whose entries expire after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Register a pending ack for `message_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::DuplicateMessageId`] if the id is already pending.
    pub fn register(
        &mut self,
        message_id: MessageId,
        now: Instant,
    ) -> Result<PendingConfirmation, SendError> {
        if self.entries.contains_key(&message_id) {
            return Err(SendError::DuplicateMessageId(message_id));
        }
        let (completion, rx) = oneshot::channel();
        self.entries.insert(
            message_id.clone(),
            PendingAck {
                message_id: message_id.clone(),
                created_at: now,
                deadline: deadline_after(now, self.timeout),
                completion,
            },
        );
        Ok(PendingConfirmation { message_id, rx })
    }

    /// Resolve the entry matching `confirm`. Returns `false` for an unknown
    /// or already expired id.
    pub fn resolve(&mut self, confirm: &Confirm) -> bool {
        let Some(entry) = self.entries.remove(&confirm.message_id) else {
            return false;
        };
        let _ = entry.completion.send(Ok(Confirmation::from(confirm)));
        true
    }

    /// Remove an entry without completing it.
    pub fn remove(&mut self, message_id: &MessageId) -> Option<PendingAck> {
        self.entries.remove(message_id)
    }

    /// Fail every entry whose deadline is at or before `now` with
    /// [`SendError::ConfirmationTimeout`]. Returns the expired ids.
    pub fn expire(&mut self, now: Instant) -> Vec<MessageId> {
        let expired: Vec<MessageId> = self
            .entries
            .values()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.message_id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                let _ = entry.completion.send(Err(SendError::ConfirmationTimeout));
            }
        }
        expired
    }

    /// Earliest deadline among pending entries.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Fail every entry with [`SendError::Disconnected`].
    pub fn reject_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.completion.send(Err(SendError::Disconnected));
        }
        count
    }

    /// Whether `message_id` is pending.
    #[must_use]
    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingAckTable {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_TIMEOUT)
    }
}
