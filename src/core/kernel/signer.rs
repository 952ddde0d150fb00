use crate::core::config::{ConfigError, Credentials};
use crate::core::errors::GremlinError;
use crate::core::types::SignedRequest;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "neptune-db";
const TERMINATOR: &str = "aws4_request";

/// Source of the signing timestamp
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant, for reproducible signatures
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Signer trait for connection authentication
///
/// Every connect attempt, and every health probe, is signed again so the
/// timestamp stays fresh across retries.
pub trait RequestSigner: Send + Sync {
    /// Sign a `GET {protocol}://{host}:{port}{path}` request
    fn sign(
        &self,
        host: &str,
        port: u16,
        path: &str,
        protocol: &str,
    ) -> Result<SignedRequest, GremlinError>;
}

/// AWS Signature Version 4 signer for the `neptune-db` service
pub struct SigV4Signer {
    credentials: Credentials,
    clock: Arc<dyn Clock>,
}

impl SigV4Signer {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_clock(credentials, Arc::new(SystemClock))
    }

    pub fn with_clock(credentials: Credentials, clock: Arc<dyn Clock>) -> Self {
        Self { credentials, clock }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

impl std::fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("region", &self.credentials.region())
            .finish_non_exhaustive()
    }
}

impl RequestSigner for SigV4Signer {
    fn sign(
        &self,
        host: &str,
        port: u16,
        path: &str,
        protocol: &str,
    ) -> Result<SignedRequest, GremlinError> {
        sign_request(host, port, &self.credentials, path, protocol, self.clock.now())
    }
}

/// Compute the signed URL and headers for an empty-body GET at `now`.
pub fn sign_request(
    host: &str,
    port: u16,
    credentials: &Credentials,
    path: &str,
    protocol: &str,
    now: DateTime<Utc>,
) -> Result<SignedRequest, GremlinError> {
    if host.is_empty() {
        return Err(ConfigError::MissingEndpoint("host".to_string()).into());
    }
    if port == 0 {
        return Err(ConfigError::MissingEndpoint("port".to_string()).into());
    }
    if credentials.access_key().is_empty() {
        return Err(ConfigError::MissingCredential("access key".to_string()).into());
    }
    if credentials.secret_key().is_empty() {
        return Err(ConfigError::MissingCredential("secret key".to_string()).into());
    }
    if credentials.region().is_empty() {
        return Err(ConfigError::MissingCredential("region".to_string()).into());
    }

    let path = if path.is_empty() { "/" } else { path };
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let host_header = format!("{}:{}", host, port);

    let mut canonical: Vec<(&str, &str)> =
        vec![("host", host_header.as_str()), ("x-amz-date", amz_date.as_str())];
    if let Some(token) = credentials.session_token() {
        canonical.push(("x-amz-security-token", token));
    }

    let canonical_headers = canonical
        .iter()
        .map(|(key, value)| format!("{}:{}", key, value))
        .collect::<Vec<_>>()
        .join("\n");
    let signed_headers = canonical
        .iter()
        .map(|(key, _)| *key)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "GET\n{}\n\n{}\n\n{}\n{}",
        path,
        canonical_headers,
        signed_headers,
        hex_sha256(b"")
    );
    trace!("Canonical request: {:?}", canonical_request);

    let scope = format!(
        "{}/{}/{}/{}",
        date_stamp,
        credentials.region(),
        SERVICE,
        TERMINATOR
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        credentials.secret_key(),
        &date_stamp,
        credentials.region(),
    )?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM,
        credentials.access_key(),
        scope,
        signed_headers,
        signature
    );

    let mut headers = HashMap::new();
    headers.insert("Host".to_string(), host_header);
    headers.insert("X-Amz-Date".to_string(), amz_date);
    headers.insert("Authorization".to_string(), authorization);
    if let Some(token) = credentials.session_token() {
        headers.insert("X-Amz-Security-Token".to_string(), token.to_string());
    }

    Ok(SignedRequest {
        url: format!("{}://{}:{}{}", protocol, host, port, path),
        headers,
    })
}

fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
) -> Result<Zeroizing<Vec<u8>>, GremlinError> {
    let seed = Zeroizing::new(format!("AWS4{}", secret_key).into_bytes());
    let mut key = Zeroizing::new(hmac_sha256(&seed, date_stamp.as_bytes())?);
    for part in [region, SERVICE, TERMINATOR] {
        key = Zeroizing::new(hmac_sha256(&key, part.as_bytes())?);
    }
    Ok(key)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, GremlinError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| GremlinError::AuthError(format!("Invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
