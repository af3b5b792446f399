//! WebSocket transport to a chat backend.
//!
//! Implements [`Transport`] over a tokio-tungstenite client connection.
//! Frames are carried as WebSocket text messages. A background reader task
//! forwards inbound text into a channel so that [`Transport::recv`] stays
//! cancel safe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Connector, Transport, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for opening the WebSocket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the reader -> transport channel.
const INCOMING_BUFFER: usize = 256;

/// Opens [`WebSocketTransport`]s to a fixed backend URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for `url` (ws:// or wss://).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The backend URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    fn connect(
        &self,
    ) -> impl std::future::Future<Output = Result<WebSocketTransport, TransportError>> + Send + 'static
    {
        let url = self.url.clone();
        let timeout = self.connect_timeout;
        async move { WebSocketTransport::connect(&url, timeout).await }
    }
}

/// An open WebSocket connection to the backend.
pub struct WebSocketTransport {
    /// Write half of the WebSocket connection.
    ws_sender: Mutex<WsSender>,
    /// Text frames (or the terminal error) from the reader task.
    incoming: Mutex<mpsc::Receiver<Result<String, TransportError>>>,
    /// Whether the connection is still usable.
    connected: Arc<AtomicBool>,
    /// Background reader task; aborted on drop.
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake does not finish in time.
    /// - [`TransportError::Unreachable`] if the backend refuses the connection.
    /// - [`TransportError::WebSocket`] / [`TransportError::Io`] for other failures.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "websocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "websocket connect failed");
                map_ws_connect_error(url, e)
            })?;

        tracing::info!(url, "websocket connection established");

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        Ok(Self {
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }

    /// Whether the connection is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl Transport for WebSocketTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(frame.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "websocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv()
            .await
            .unwrap_or(Err(TransportError::ConnectionClosed))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "websocket close handshake failed");
        }
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

/// Background task that reads WebSocket messages into `tx`.
///
/// Text frames are forwarded as-is. A close frame or end of stream ends the
/// channel (seen as [`TransportError::ConnectionClosed`]); a read error is
/// forwarded once and then ends the channel.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<Result<String, TransportError>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if tx.send(Ok(text.as_str().to_owned())).await.is_err() {
                    // Transport dropped.
                    break;
                }
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => {
                    if tx.send(Ok(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => tracing::warn!("non-UTF-8 binary frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("websocket closed by backend");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                // Control frames are answered by tungstenite itself.
            }
            Err(e) => {
                tracing::warn!(err = %e, "websocket read error");
                let _ = tx.send(Err(TransportError::WebSocket(e.to_string()))).await;
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("websocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => {
            TransportError::WebSocket(format!("backend HTTP error: status {}", response.status()))
        }
        other => TransportError::WebSocket(other.to_string()),
    }
}
