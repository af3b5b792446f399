//! Frame types exchanged between a client and the chat backend.
//!
//! Every frame is a JSON object with a snake_case `type` tag and camelCase
//! fields. Outbound frames always carry `clientId` and `timestamp`; the
//! backend is allowed to omit them on inbound frames.

use serde::{Deserialize, Serialize};

use crate::message::{
    ActivityStatus, ClientId, ConversationId, ImageData, ImageStatus, MessageId, Timestamp,
};

/// Value of `status` in a granted `connect_confirm`.
pub const CONNECT_CONFIRMED: &str = "confirmed";

/// Value of `status` in a `confirm` frame.
pub const CONFIRM_RECEIVED: &str = "received";

/// All frame kinds of the session protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client announces itself and requests a session.
    Connect(Connect),
    /// Server grants a session.
    ConnectConfirm(ConnectConfirm),
    /// User content.
    Message(ChatMessage),
    /// Server acknowledges a sent message.
    Confirm(Confirm),
    /// Assistant reply.
    Response(Response),
    /// Progress of one image of a message.
    ImageStatus(ImageStatusUpdate),
    /// Typing / progress indicator.
    Status(StatusUpdate),
    /// Liveness probe from the server.
    Ping(Heartbeat),
    /// Liveness reply from the client.
    Pong(Heartbeat),
    /// Server-reported failure.
    Error(ServerError),
}

/// Short, stable name of a frame kind (the `type` tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// `connect`
    Connect,
    /// `connect_confirm`
    ConnectConfirm,
    /// `message`
    Message,
    /// `confirm`
    Confirm,
    /// `response`
    Response,
    /// `image_status`
    ImageStatus,
    /// `status`
    Status,
    /// `ping`
    Ping,
    /// `pong`
    Pong,
    /// `error`
    Error,
}

impl FrameKind {
    /// The wire tag of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::ConnectConfirm => "connect_confirm",
            Self::Message => "message",
            Self::Confirm => "confirm",
            Self::Response => "response",
            Self::ImageStatus => "image_status",
            Self::Status => "status",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `connect`: first frame sent after the transport opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connect {
    /// Durable client identifier.
    pub client_id: ClientId,
    /// Send time.
    pub timestamp: Timestamp,
}

/// `connect_confirm`: the server's session grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectConfirm {
    /// Identifier of the granted session.
    pub conversation_id: ConversationId,
    /// Grant status; only [`CONNECT_CONFIRMED`] opens the session.
    pub status: String,
    /// Echo of the client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Server time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl ConnectConfirm {
    /// Whether the server granted the session.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.status == CONNECT_CONFIRMED
    }
}

/// `message`: user content sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Identifier used to correlate the server's `confirm`.
    pub message_id: MessageId,
    /// Active session.
    pub conversation_id: ConversationId,
    /// Sending client.
    pub client_id: ClientId,
    /// Send time.
    pub timestamp: Timestamp,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Attached images.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageData>,
}

/// `confirm`: acknowledgment that a message reached the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirm {
    /// The acknowledged message.
    pub message_id: MessageId,
    /// Always [`CONFIRM_RECEIVED`] in practice.
    #[serde(default = "confirm_received")]
    pub status: String,
    /// Echo of the client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Server time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

fn confirm_received() -> String {
    CONFIRM_RECEIVED.to_string()
}

/// `response`: an assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Identifier of the reply itself.
    pub message_id: MessageId,
    /// The user message this answers, if the backend says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Reply text.
    pub content: String,
    /// Echo of the client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Reply time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `image_status`: pipeline progress for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatusUpdate {
    /// Message the image belongs to.
    pub message_id: MessageId,
    /// Image identifier, unique within the message.
    pub image_id: String,
    /// New pipeline status.
    pub status: ImageStatus,
    /// Echo of the client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Server time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `status`: backend activity for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Message the activity relates to.
    pub message_id: MessageId,
    /// Activity value (`idle`, `thinking`, `processing`, ...).
    pub status: ActivityStatus,
    /// Echo of the client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Server time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// Body of `ping` and `pong`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Client id (always present on `pong`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `error`: failure reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    /// Human-readable error text.
    pub error: String,
    /// Echo of the client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Server time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl Frame {
    /// Builds a `connect` frame stamped with the current time.
    #[must_use]
    pub fn connect(client_id: ClientId) -> Self {
        Self::Connect(Connect {
            client_id,
            timestamp: Timestamp::now(),
        })
    }

    /// Builds a `pong` frame stamped with the current time.
    #[must_use]
    pub fn pong(client_id: ClientId) -> Self {
        Self::Pong(Heartbeat {
            client_id: Some(client_id),
            timestamp: Some(Timestamp::now()),
        })
    }

    /// Builds a `ping` frame stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping(Heartbeat {
            client_id: None,
            timestamp: Some(Timestamp::now()),
        })
    }

    /// The kind of this frame.
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::Connect(_) => FrameKind::Connect,
            Self::ConnectConfirm(_) => FrameKind::ConnectConfirm,
            Self::Message(_) => FrameKind::Message,
            Self::Confirm(_) => FrameKind::Confirm,
            Self::Response(_) => FrameKind::Response,
            Self::ImageStatus(_) => FrameKind::ImageStatus,
            Self::Status(_) => FrameKind::Status,
            Self::Ping(_) => FrameKind::Ping,
            Self::Pong(_) => FrameKind::Pong,
            Self::Error(_) => FrameKind::Error,
        }
    }

    /// The message id carried by this frame, if its kind has one.
    #[must_use]
    pub const fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Message(m) => Some(&m.message_id),
            Self::Confirm(c) => Some(&c.message_id),
            Self::Response(r) => Some(&r.message_id),
            Self::ImageStatus(s) => Some(&s.message_id),
            Self::Status(s) => Some(&s.message_id),
            Self::Connect(_)
            | Self::ConnectConfirm(_)
            | Self::Ping(_)
            | Self::Pong(_)
            | Self::Error(_) => None,
        }
    }
}
