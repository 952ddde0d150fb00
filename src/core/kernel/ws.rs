use crate::core::errors::GremlinError;
use crate::core::types::SignedRequest;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something the socket reported after it was connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A complete data message
    Message(Vec<u8>),
    /// The peer closed the socket, or the stream ended
    Closed { code: Option<u16>, reason: String },
    /// The socket failed
    Error(GremlinError),
}

/// Transport trait - opens physical socket sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a socket for a signed request
    async fn connect(&self, request: &SignedRequest)
        -> Result<Box<dyn SocketSession>, GremlinError>;
}

/// One physical socket connection
///
/// `next_event` must be cancel safe: the connection polls it alongside other
/// work and drops the future whenever something else becomes ready first.
#[async_trait]
pub trait SocketSession: Send {
    /// Write one binary message
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), GremlinError>;

    /// Wait for the next event; after `Closed` or `Error` the session is finished
    async fn next_event(&mut self) -> SessionEvent;

    /// Request the socket to close
    async fn close(&mut self) -> Result<(), GremlinError>;
}

/// Tungstenite-based transport
#[derive(Debug, Clone)]
pub struct TungsteniteTransport {
    connect_timeout: Duration,
}

impl TungsteniteTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn connect(
        &self,
        request: &SignedRequest,
    ) -> Result<Box<dyn SocketSession>, GremlinError> {
        let mut client_request = request.url.as_str().into_client_request().map_err(|e| {
            GremlinError::ConnectError(format!("Invalid socket URL {}: {}", request.url, e))
        })?;

        for (key, value) in &request.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                GremlinError::ConnectError(format!("Invalid header name {}: {}", key, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                GremlinError::ConnectError(format!("Invalid header value for {}: {}", key, e))
            })?;
            client_request.headers_mut().insert(name, value);
        }

        let (stream, response) =
            tokio::time::timeout(self.connect_timeout, connect_async(client_request))
                .await
                .map_err(|_| {
                    GremlinError::ConnectError("WebSocket connection timeout".to_string())
                })?
                .map_err(|e| {
                    GremlinError::ConnectError(format!("WebSocket connection failed: {}", e))
                })?;

        debug!(status = %response.status(), "WebSocket handshake complete");

        let (write, read) = stream.split();
        Ok(Box::new(TungsteniteSession {
            write,
            read,
            stats: SessionStats::default(),
        }))
    }
}

/// Traffic counters for one session
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

struct TungsteniteSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    stats: SessionStats,
}

#[async_trait]
impl SocketSession for TungsteniteSession {
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), GremlinError> {
        let len = payload.len() as u64;
        self.write
            .send(Message::Binary(payload))
            .await
            .map_err(|e| GremlinError::NetworkError(format!("Failed to send message: {}", e)))?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;
        Ok(())
    }

    async fn next_event(&mut self) -> SessionEvent {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.stats.messages_received += 1;
                    self.stats.bytes_received += data.len() as u64;
                    return SessionEvent::Message(data);
                }
                Some(Ok(Message::Text(text))) => {
                    self.stats.messages_received += 1;
                    self.stats.bytes_received += text.len() as u64;
                    return SessionEvent::Message(text.into_bytes());
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((None, String::new()), |frame| {
                        (Some(u16::from(frame.code)), frame.reason.into_owned())
                    });
                    debug!(?code, %reason, stats = ?self.stats, "Socket closed by peer");
                    return SessionEvent::Closed { code, reason };
                }
                // Pings are answered by tungstenite on the next read or write
                Some(Ok(other)) => {
                    trace!("Ignoring control frame: {:?}", other);
                }
                Some(Err(e)) => return SessionEvent::Error(e.into()),
                None => {
                    return SessionEvent::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), GremlinError> {
        debug!(stats = ?self.stats, "Closing socket");
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
