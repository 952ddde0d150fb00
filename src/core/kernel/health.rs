use crate::core::errors::GremlinError;
use crate::core::types::SignedRequest;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Path of the server's HTTP status endpoint
pub const STATUS_PATH: &str = "/status";

/// Upper bound on one liveness probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Cheap liveness check run before a socket handshake
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, request: &SignedRequest) -> Result<(), GremlinError>;
}

/// Probe backed by a reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestProbe {
    client: Client,
}

impl ReqwestProbe {
    pub fn new() -> Result<Self, GremlinError> {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .user_agent("gremlin-sigv4/0.1")
            .build()
            .map_err(|e| {
                GremlinError::ConnectError(format!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }
}

#[derive(Deserialize)]
struct StatusBody {
    status: Option<String>,
}

#[async_trait]
impl HealthProbe for ReqwestProbe {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn check(&self, request: &SignedRequest) -> Result<(), GremlinError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &request.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                GremlinError::ConnectError(format!("Invalid header name {}: {}", key, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                GremlinError::ConnectError(format!("Invalid header value for {}: {}", key, e))
            })?;
            headers.insert(name, value);
        }

        let response = self
            .client
            .get(&request.url)
            .headers(headers)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(%status, "Health probe answered");

        if !status.is_success() {
            return Err(GremlinError::ConnectError(format!(
                "Health check failed with HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        // Older servers answer with an empty body; only an explicit bad status fails
        match serde_json::from_str::<StatusBody>(&body) {
            Ok(StatusBody {
                status: Some(server_status),
            }) if server_status != "healthy" => Err(GremlinError::ConnectError(format!(
                "Server reports status '{}'",
                server_status
            ))),
            _ => Ok(()),
        }
    }
}
