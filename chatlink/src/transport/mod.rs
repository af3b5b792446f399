//! Transport layer abstraction for `chatlink`.
//!
//! A [`Connector`] opens a fresh [`Transport`] per connection attempt. The
//! transport is message-oriented: one call to [`Transport::send`] carries
//! one text frame, and [`Transport::recv`] yields one text frame at a time.
//! Implementations:
//! - [`websocket::WebSocketConnector`]: tokio-tungstenite client
//! - [`loopback::LoopbackConnector`]: in-process channels for tests

pub mod loopback;
pub mod websocket;

use std::fmt;
use std::future::Future;

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket connection to a chat backend.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The backend could not be reached.
    #[error("backend {0} is unreachable")]
    Unreachable(String),

    /// The WebSocket layer reported an error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open, message-oriented connection to the backend.
///
/// # Invariant
///
/// After [`Transport::recv`] has returned an error the connection is dead:
/// [`TransportError::ConnectionClosed`] means the peer closed it cleanly,
/// any other error means it failed.
pub trait Transport: Send + Sync + 'static {
    /// Send one text frame.
    ///
    /// Returns `Ok(())` once the frame is handed to the underlying
    /// connection. This does NOT guarantee delivery.
    fn send(&self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next text frame.
    ///
    /// Cancel safe: dropping the future before completion loses no frame.
    fn recv(&self) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Close the connection. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}

/// Opens transports. One call per connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// The transport produced by this connector.
    type Transport: Transport;

    /// Open a new connection.
    ///
    /// The returned future must not borrow `self`, so the connection
    /// manager can poll it while handling other events.
    fn connect(
        &self,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send + 'static;
}
