use thiserror::Error;

/// Errors surfaced by the connection, the signer and the transport.
///
/// Every variant is cheap to clone: a single connection-level failure is handed
/// to every caller waiting on `open()` and to every drained request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GremlinError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),

    #[error("Connection failed: {0}")]
    ConnectError(String),

    #[error("Server error: {message} ({code})")]
    ServerError { code: u16, message: String },

    #[error("Server error (no request information): {message} ({code})")]
    UnattributedServerError { code: u16, message: String },

    #[error("Malformed server response: {0}")]
    MalformedResponse(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),
}

impl GremlinError {
    /// Whether the error concerns the whole connection rather than one request.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::ConnectError(_) | Self::ConnectionClosed(_) | Self::NetworkError(_)
        )
    }
}

impl From<serde_json::Error> for GremlinError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for GremlinError {
    fn from(err: reqwest::Error) -> Self {
        Self::ConnectError(format!("HTTP request failed: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GremlinError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}
