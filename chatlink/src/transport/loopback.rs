//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to simulate a chat
//! backend. Created via [`LoopbackConnector::new`], which returns the
//! connector handed to the client and a [`LoopbackServer`] that receives
//! the server end of every connection the client opens.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use chatlink_proto::codec;
use chatlink_proto::frame::Frame;

use super::{Connector, Transport, TransportError, TransportType};

/// Channel capacity for each direction of a loopback connection.
const LOOPBACK_BUFFER: usize = 64;

/// What the server end pushes toward the client.
type ServerItem = Result<String, TransportError>;

/// Client side of a loopback connection.
pub struct LoopbackTransport {
    /// Frames toward the server end; `None` once closed.
    tx: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
    /// Frames (or a failure) from the server end.
    rx: Mutex<mpsc::Receiver<ServerItem>>,
}

impl Transport for LoopbackTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(TransportError::ConnectionClosed);
        };
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.unwrap_or(Err(TransportError::ConnectionClosed))
    }

    async fn close(&self) {
        self.tx.lock().take();
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

/// Server end of one loopback connection, driven by the test.
pub struct LoopbackPeer {
    /// Frames toward the client.
    tx: mpsc::Sender<ServerItem>,
    /// Frames from the client.
    rx: mpsc::Receiver<String>,
}

impl LoopbackPeer {
    /// Send raw text to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client dropped
    /// the connection.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(Ok(text.into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Encode and send a frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client dropped
    /// the connection.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = codec::encode(frame).map_err(|e| TransportError::WebSocket(e.to_string()))?;
        self.send_text(text).await
    }

    /// Receive the next frame the client sent, or `None` once the client
    /// closed its side. Undecodable text is skipped.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            let text = self.rx.recv().await?;
            match codec::decode(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!(error = %e, "loopback peer got undecodable frame"),
            }
        }
    }

    /// Fail the connection with a transport error.
    pub async fn fail(self) {
        let _ = self
            .tx
            .send(Err(TransportError::WebSocket("simulated failure".into())))
            .await;
    }

    /// Close the connection cleanly from the server side.
    pub fn close(self) {
        drop(self);
    }
}

/// Accepts the server ends of connections opened through a [`LoopbackConnector`].
pub struct LoopbackServer {
    incoming: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl LoopbackServer {
    /// Wait for the client to open the next connection.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.incoming.recv().await
    }
}

/// In-process [`Connector`] whose connections terminate at a [`LoopbackServer`].
#[derive(Clone)]
pub struct LoopbackConnector {
    incoming: mpsc::UnboundedSender<LoopbackPeer>,
    refuse: Arc<AtomicBool>,
}

impl LoopbackConnector {
    /// Create a connector and the server that accepts its connections.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use chatlink::transport::loopback::LoopbackConnector;
    /// use chatlink::transport::{Connector, Transport};
    ///
    /// # async fn example() {
    /// let (connector, mut server) = LoopbackConnector::new();
    /// let transport = connector.connect().await.unwrap();
    /// let peer = server.accept().await.unwrap();
    /// peer.send_text(r#"{"type":"ping"}"#).await.unwrap();
    /// assert_eq!(transport.recv().await.unwrap(), r#"{"type":"ping"}"#);
    /// # }
    /// ```
    #[must_use]
    pub fn new() -> (Self, LoopbackServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: tx,
                refuse: Arc::new(AtomicBool::new(false)),
            },
            LoopbackServer { incoming: rx },
        )
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    fn connect(
        &self,
    ) -> impl std::future::Future<Output = Result<LoopbackTransport, TransportError>> + Send + 'static
    {
        let incoming = self.incoming.clone();
        let refuse = self.refuse.load(Ordering::Relaxed);
        async move {
            if refuse {
                return Err(TransportError::Unreachable("loopback".into()));
            }
            let (to_server_tx, to_server_rx) = mpsc::channel(LOOPBACK_BUFFER);
            let (to_client_tx, to_client_rx) = mpsc::channel(LOOPBACK_BUFFER);
            let peer = LoopbackPeer {
                tx: to_client_tx,
                rx: to_server_rx,
            };
            incoming
                .send(peer)
                .map_err(|_| TransportError::Unreachable("loopback".into()))?;
            Ok(LoopbackTransport {
                tx: parking_lot::Mutex::new(Some(to_server_tx)),
                rx: Mutex::new(to_client_rx),
            })
        }
    }
}
