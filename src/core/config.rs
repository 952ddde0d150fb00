use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::time::Duration;

/// Content type announced in front of every request frame
pub const DEFAULT_MIME_TYPE: &str = "application/vnd.gremlin-v2.0+json";
pub const DEFAULT_TRAVERSAL_SOURCE: &str = "g";
pub const DEFAULT_MAX_RETRY: u32 = 10;
pub const DEFAULT_PORT: u16 = 8182;

const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Options recognised by a [`Connection`](crate::core::connection::Connection).
///
/// Credentials given here take precedence over the `AWS_*` environment
/// variables; anything left as `None` is looked up when the connection is built.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub access_key: Option<Secret<String>>,
    pub secret_key: Option<Secret<String>>,
    pub session_token: Option<Secret<String>>,
    pub region: Option<String>,
    /// Retry automatically when a connect attempt fails or the socket drops
    pub auto_reconnect: bool,
    /// Ceiling on consecutive retries before a failure is surfaced
    pub max_retry: u32,
    /// Alias bound to `g` on the server
    pub traversal_source: String,
    pub mime_type: String,
    /// Use `wss`/`https` instead of `ws`/`http`
    pub secure: bool,
    /// Probe the HTTP status endpoint before opening the socket
    pub probe_health: bool,
    /// Initial delay between reconnect attempts, doubled on every retry
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

// Never expose secrets in serialization
impl Serialize for ConnectionOptions {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let redacted = |secret: &Option<Secret<String>>| secret.as_ref().map(|_| "[REDACTED]");

        let mut state = serializer.serialize_struct("ConnectionOptions", 14)?;
        state.serialize_field("host", &self.host)?;
        state.serialize_field("port", &self.port)?;
        state.serialize_field("access_key", &redacted(&self.access_key))?;
        state.serialize_field("secret_key", &redacted(&self.secret_key))?;
        state.serialize_field("session_token", &redacted(&self.session_token))?;
        state.serialize_field("region", &self.region)?;
        state.serialize_field("auto_reconnect", &self.auto_reconnect)?;
        state.serialize_field("max_retry", &self.max_retry)?;
        state.serialize_field("traversal_source", &self.traversal_source)?;
        state.serialize_field("mime_type", &self.mime_type)?;
        state.serialize_field("secure", &self.secure)?;
        state.serialize_field("probe_health", &self.probe_health)?;
        state.serialize_field("reconnect_delay_ms", &millis(self.reconnect_delay))?;
        state.serialize_field("connect_timeout_ms", &millis(self.connect_timeout))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ConnectionOptions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ConnectionOptionsHelper {
            host: String,
            #[serde(default = "default_port")]
            port: u16,
            access_key: Option<String>,
            secret_key: Option<String>,
            session_token: Option<String>,
            region: Option<String>,
            #[serde(default)]
            auto_reconnect: bool,
            #[serde(default = "default_max_retry")]
            max_retry: u32,
            traversal_source: Option<String>,
            mime_type: Option<String>,
            #[serde(default)]
            secure: bool,
            #[serde(default)]
            probe_health: bool,
            reconnect_delay_ms: Option<u64>,
            connect_timeout_ms: Option<u64>,
        }

        fn default_port() -> u16 {
            DEFAULT_PORT
        }

        fn default_max_retry() -> u32 {
            DEFAULT_MAX_RETRY
        }

        let helper = ConnectionOptionsHelper::deserialize(deserializer)?;
        Ok(Self {
            host: helper.host,
            port: helper.port,
            access_key: helper.access_key.map(Secret::new),
            secret_key: helper.secret_key.map(Secret::new),
            session_token: helper.session_token.map(Secret::new),
            region: helper.region,
            auto_reconnect: helper.auto_reconnect,
            max_retry: helper.max_retry,
            traversal_source: helper
                .traversal_source
                .unwrap_or_else(|| DEFAULT_TRAVERSAL_SOURCE.to_string()),
            mime_type: helper
                .mime_type
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            secure: helper.secure,
            probe_health: helper.probe_health,
            reconnect_delay: Duration::from_millis(
                helper
                    .reconnect_delay_ms
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
            connect_timeout: Duration::from_millis(
                helper
                    .connect_timeout_ms
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ConnectionOptions {
    /// Create options for a server endpoint; credentials come from the environment
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            access_key: None,
            secret_key: None,
            session_token: None,
            region: None,
            auto_reconnect: false,
            max_retry: DEFAULT_MAX_RETRY,
            traversal_source: DEFAULT_TRAVERSAL_SOURCE.to_string(),
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            secure: false,
            probe_health: false,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    /// Create options from environment variables
    ///
    /// Expected environment variables:
    /// - `NEPTUNE_HOST`
    /// - `NEPTUNE_PORT` (optional, defaults to 8182)
    /// - `NEPTUNE_SECURE` (optional, defaults to false)
    /// - `NEPTUNE_AUTO_RECONNECT` (optional, defaults to false)
    /// - `NEPTUNE_MAX_RETRY` (optional, defaults to 10)
    /// - `NEPTUNE_TRAVERSAL_SOURCE` (optional, defaults to `g`)
    ///
    /// Signing credentials are resolved separately from the `AWS_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("NEPTUNE_HOST")
            .map_err(|_| ConfigError::MissingEnvironmentVariable("NEPTUNE_HOST".to_string()))?;

        let port = match env::var("NEPTUNE_PORT") {
            Ok(port) => port.parse::<u16>().map_err(|e| {
                ConfigError::InvalidConfiguration(format!("NEPTUNE_PORT '{}': {}", port, e))
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let flag = |name: &str| {
            env::var(name)
                .ok()
                .and_then(|value| value.parse::<bool>().ok())
                .unwrap_or(false)
        };

        let mut options = Self::new(host, port)
            .secure(flag("NEPTUNE_SECURE"))
            .auto_reconnect(flag("NEPTUNE_AUTO_RECONNECT"));

        if let Ok(max_retry) = env::var("NEPTUNE_MAX_RETRY") {
            options.max_retry = max_retry.parse().map_err(|e| {
                ConfigError::InvalidConfiguration(format!(
                    "NEPTUNE_MAX_RETRY '{}': {}",
                    max_retry, e
                ))
            })?;
        }
        if let Ok(source) = env::var("NEPTUNE_TRAVERSAL_SOURCE") {
            options.traversal_source = source;
        }

        Ok(options)
    }

    /// Create options from a .env file and environment variables
    ///
    /// A missing file is not an error: system environment variables are used as-is.
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env()
    }

    /// Set explicit signing credentials
    #[must_use]
    pub fn credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        self.access_key = Some(Secret::new(access_key.into()));
        self.secret_key = Some(Secret::new(secret_key.into()));
        self.region = Some(region.into());
        self
    }

    #[must_use]
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(Secret::new(token.into()));
        self
    }

    #[must_use]
    pub const fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub const fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    #[must_use]
    pub fn traversal_source(mut self, source: impl Into<String>) -> Self {
        self.traversal_source = source.into();
        self
    }

    #[must_use]
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    #[must_use]
    pub const fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub const fn probe_health(mut self, enabled: bool) -> Self {
        self.probe_health = enabled;
        self
    }

    #[must_use]
    pub const fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Scheme of the socket URL
    pub fn socket_protocol(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    /// Scheme of the HTTP status endpoint
    pub fn http_protocol(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Check the endpoint and framing options, without touching credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint("host".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::MissingEndpoint("port".to_string()));
        }
        // The mime type is prefixed by a single length byte
        if self.mime_type.is_empty() || self.mime_type.len() > usize::from(u8::MAX) {
            return Err(ConfigError::InvalidConfiguration(format!(
                "mime type must be 1..=255 bytes, got {}",
                self.mime_type.len()
            )));
        }
        Ok(())
    }
}

/// Resolved signing identity
#[derive(Debug, Clone)]
pub struct Credentials {
    access_key: Secret<String>,
    secret_key: Secret<String>,
    session_token: Option<Secret<String>>,
    region: String,
}

impl Credentials {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: Secret::new(access_key.into()),
            secret_key: Secret::new(secret_key.into()),
            session_token: None,
            region: region.into(),
        }
    }

    #[must_use]
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(Secret::new(token.into()));
        self
    }

    /// Resolve credentials from the options, falling back to the process environment
    pub fn resolve(options: &ConnectionOptions) -> Result<Self, ConfigError> {
        Self::resolve_with(options, |name| env::var(name).ok())
    }

    /// Resolve credentials from the options, falling back to `lookup` for
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN` and
    /// `AWS_DEFAULT_REGION` (then `AWS_REGION`). Empty values count as missing.
    pub fn resolve_with<F>(options: &ConnectionOptions, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = |secret: &Option<Secret<String>>| {
            secret
                .as_ref()
                .map(|s| s.expose_secret().clone())
                .filter(|s| !s.is_empty())
        };
        let from_env = |name: &str| lookup(name).filter(|s| !s.is_empty());

        let access_key = explicit(&options.access_key)
            .or_else(|| from_env("AWS_ACCESS_KEY_ID"))
            .ok_or_else(|| ConfigError::MissingCredential("access key".to_string()))?;
        let secret_key = explicit(&options.secret_key)
            .or_else(|| from_env("AWS_SECRET_ACCESS_KEY"))
            .ok_or_else(|| ConfigError::MissingCredential("secret key".to_string()))?;
        let session_token =
            explicit(&options.session_token).or_else(|| from_env("AWS_SESSION_TOKEN"));
        let region = options
            .region
            .clone()
            .filter(|r| !r.is_empty())
            .or_else(|| from_env("AWS_DEFAULT_REGION"))
            .or_else(|| from_env("AWS_REGION"))
            .ok_or_else(|| ConfigError::MissingCredential("region".to_string()))?;

        Ok(Self {
            access_key: Secret::new(access_key),
            secret_key: Secret::new(secret_key),
            session_token: session_token.map(Secret::new),
            region,
        })
    }

    /// Get access key (use carefully - exposes secret)
    pub fn access_key(&self) -> &str {
        self.access_key.expose_secret()
    }

    /// Get secret key (use carefully - exposes secret)
    pub fn secret_key(&self) -> &str {
        self.secret_key.expose_secret()
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token
            .as_ref()
            .map(|token| token.expose_secret().as_str())
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Host and port are required: missing {0}")]
    MissingEndpoint(String),

    #[error("Access key, secret key and region are required: missing {0}")]
    MissingCredential(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::new("local.host", 1337);
        assert_eq!(options.traversal_source, "g");
        assert_eq!(options.mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(options.max_retry, 10);
        assert!(!options.auto_reconnect);
        assert_eq!(options.socket_protocol(), "ws");
        assert_eq!(options.http_protocol(), "http");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_missing_endpoint() {
        assert_eq!(
            ConnectionOptions::new("", 1337).validate(),
            Err(ConfigError::MissingEndpoint("host".to_string()))
        );
        assert_eq!(
            ConnectionOptions::new("local.host", 0).validate(),
            Err(ConfigError::MissingEndpoint("port".to_string()))
        );
    }

    #[test]
    fn test_oversized_mime_type_rejected() {
        let options = ConnectionOptions::new("local.host", 1337).mime_type("x".repeat(256));
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_explicit_credentials_win_over_environment() {
        let options = ConnectionOptions::new("local.host", 1337).credentials(
            "MY_ACCESS_KEY",
            "MY_SECRET_KEY",
            "MY_REGION",
        );
        let env = lookup(&[
            ("AWS_ACCESS_KEY_ID", "ENV_ACCESS"),
            ("AWS_SECRET_ACCESS_KEY", "ENV_SECRET"),
            ("AWS_DEFAULT_REGION", "ENV_REGION"),
        ]);

        let creds = Credentials::resolve_with(&options, env).unwrap();
        assert_eq!(creds.access_key(), "MY_ACCESS_KEY");
        assert_eq!(creds.secret_key(), "MY_SECRET_KEY");
        assert_eq!(creds.region(), "MY_REGION");
        assert_eq!(creds.session_token(), None);
    }

    #[test]
    fn test_environment_fallback() {
        let options = ConnectionOptions::new("local.host", 1337);
        let env = lookup(&[
            ("AWS_ACCESS_KEY_ID", "ENV_ACCESS"),
            ("AWS_SECRET_ACCESS_KEY", "ENV_SECRET"),
            ("AWS_SESSION_TOKEN", "ENV_TOKEN"),
            ("AWS_REGION", "eu-west-1"),
        ]);

        let creds = Credentials::resolve_with(&options, env).unwrap();
        assert_eq!(creds.access_key(), "ENV_ACCESS");
        assert_eq!(creds.session_token(), Some("ENV_TOKEN"));
        assert_eq!(creds.region(), "eu-west-1");
    }

    #[test]
    fn test_each_missing_credential_is_reported() {
        let full = [
            ("AWS_ACCESS_KEY_ID", "A"),
            ("AWS_SECRET_ACCESS_KEY", "S"),
            ("AWS_DEFAULT_REGION", "R"),
        ];
        let expected = ["access key", "secret key", "region"];

        for (skip, missing) in expected.iter().enumerate() {
            let vars: Vec<(&str, &str)> = full
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, kv)| *kv)
                .collect();
            let result =
                Credentials::resolve_with(&ConnectionOptions::new("h", 1), lookup(&vars));
            assert_eq!(
                result.unwrap_err(),
                ConfigError::MissingCredential((*missing).to_string())
            );
        }
    }

    #[test]
    fn test_empty_values_count_as_missing() {
        let options = ConnectionOptions::new("h", 1).credentials("", "S", "R");
        let result = Credentials::resolve_with(&options, lookup(&[]));
        assert_eq!(
            result.unwrap_err(),
            ConfigError::MissingCredential("access key".to_string())
        );
    }

    #[test]
    fn test_serialization_redacts_secrets() {
        let options = ConnectionOptions::new("local.host", 1337)
            .credentials("MY_ACCESS_KEY", "MY_SECRET_KEY", "MY_REGION")
            .session_token("MY_TOKEN");
        let json = serde_json::to_string(&options).unwrap();
        assert!(!json.contains("MY_ACCESS_KEY"));
        assert!(!json.contains("MY_SECRET_KEY"));
        assert!(!json.contains("MY_TOKEN"));
        assert!(json.contains("[REDACTED]"));
        assert!(json.contains("MY_REGION"));
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let options: ConnectionOptions = serde_json::from_str(
            r#"{"host":"db.example","access_key":"A","secret_key":"S","region":"R","auto_reconnect":true}"#,
        )
        .unwrap();
        assert_eq!(options.port, DEFAULT_PORT);
        assert!(options.auto_reconnect);
        assert_eq!(options.traversal_source, "g");
        assert_eq!(options.reconnect_delay, Duration::from_secs(1));
        let creds = Credentials::resolve_with(&options, lookup(&[])).unwrap();
        assert_eq!(creds.secret_key(), "S");
    }
}
