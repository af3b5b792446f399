//! Messages as the client keeps them.

use serde::{Deserialize, Serialize};

use chatlink_proto::frame::Response;
use chatlink_proto::message::{ClientId, ImageStatus, MessageId, Timestamp};

/// What a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// User or assistant content.
    Content,
    /// Locally generated notice.
    System,
}

/// Delivery progress of a message.
///
/// Flags only ever go from `false` to `true`, and `processed` implies
/// `received` implies `sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageStatus {
    /// Handed to the transport.
    pub sent: bool,
    /// Confirmed by the backend.
    pub received: bool,
    /// Handled by the backend.
    pub processed: bool,
}

impl MessageStatus {
    /// Just sent.
    pub const SENT: Self = Self {
        sent: true,
        received: false,
        processed: false,
    };

    /// Confirmed received.
    pub const RECEIVED: Self = Self {
        sent: true,
        received: true,
        processed: false,
    };

    /// Fully processed.
    pub const PROCESSED: Self = Self {
        sent: true,
        received: true,
        processed: true,
    };

    /// Merge a partial update into `self`.
    ///
    /// Flags set in `update` are raised; flags it leaves `false` keep their
    /// current value. The result is normalised so that the ordering holds.
    #[must_use]
    pub const fn merge(self, update: Self) -> Self {
        Self {
            sent: self.sent || update.sent,
            received: self.received || update.received,
            processed: self.processed || update.processed,
        }
        .normalized()
    }

    /// Raise lower flags implied by higher ones.
    #[must_use]
    pub const fn normalized(self) -> Self {
        let received = self.received || self.processed;
        Self {
            sent: self.sent || received,
            received,
            processed: self.processed,
        }
    }
}

/// Progress of one image of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStatusEntry {
    /// Image id, unique within the message.
    pub image_id: String,
    /// Latest reported status.
    pub status: ImageStatus,
}

/// One entry of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id.
    pub id: MessageId,
    /// Content or system notice.
    pub kind: MessageKind,
    /// Text content.
    pub content: String,
    /// When the message was created (locally) or sent (by the backend).
    pub timestamp: Timestamp,
    /// Sender, for messages written by a client; `None` for replies.
    pub sender_client_id: Option<ClientId>,
    /// Encoded image payloads.
    pub images: Vec<String>,
    /// Per-image progress, in arrival order.
    pub image_statuses: Vec<ImageStatusEntry>,
    /// Delivery progress.
    pub status: MessageStatus,
}

impl Message {
    /// A message written by the local user.
    pub fn user(
        id: MessageId,
        content: impl Into<String>,
        images: Vec<String>,
        client_id: ClientId,
    ) -> Self {
        Self {
            id,
            kind: MessageKind::Content,
            content: content.into(),
            timestamp: Timestamp::now(),
            sender_client_id: Some(client_id),
            images,
            image_statuses: Vec::new(),
            status: MessageStatus::SENT,
        }
    }

    /// An assistant reply built from a `response` frame.
    #[must_use]
    pub fn assistant(response: &Response) -> Self {
        Self {
            id: response.message_id.clone(),
            kind: MessageKind::Content,
            content: response.content.clone(),
            timestamp: response.timestamp.clone().unwrap_or_else(Timestamp::now),
            sender_client_id: None,
            images: Vec::new(),
            image_statuses: Vec::new(),
            status: MessageStatus::PROCESSED,
        }
    }

    /// A local system notice.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            kind: MessageKind::System,
            content: content.into(),
            timestamp: Timestamp::now(),
            sender_client_id: None,
            images: Vec::new(),
            image_statuses: Vec::new(),
            status: MessageStatus::PROCESSED,
        }
    }

    /// Whether `client_id` wrote this message.
    #[must_use]
    pub fn is_from(&self, client_id: &ClientId) -> bool {
        self.sender_client_id.as_ref() == Some(client_id)
    }

    /// Latest status of image `image_id`.
    #[must_use]
    pub fn image_status(&self, image_id: &str) -> Option<ImageStatus> {
        self.image_statuses
            .iter()
            .find(|entry| entry.image_id == image_id)
            .map(|entry| entry.status)
    }

    /// Record `status` for `image_id`, replacing an existing entry in place
    /// or appending a new one. Returns whether anything changed.
    pub fn upsert_image_status(&mut self, image_id: &str, status: ImageStatus) -> bool {
        if let Some(entry) = self
            .image_statuses
            .iter_mut()
            .find(|entry| entry.image_id == image_id)
        {
            let changed = entry.status != status;
            entry.status = status;
            return changed;
        }
        self.image_statuses.push(ImageStatusEntry {
            image_id: image_id.to_owned(),
            status,
        });
        true
    }
}
