//! Configuration of the query backend connection.

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

/// Backend address used when nothing else is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

const DEFAULT_QUERY_PATH: &str = "/query";
const DEFAULT_HEALTH_PATH: &str = "/health";

const ENV_BASE_URL: &str = "PAPERCHAT_BACKEND_URL";
const ENV_CONNECT_TIMEOUT: &str = "PAPERCHAT_CONNECT_TIMEOUT_SECS";
const ENV_PROXY: &str = "PAPERCHAT_PROXY";
const ENV_API_KEY: &str = "PAPERCHAT_API_KEY";

/// A secret string type for sensitive data like API keys.
/// Prevents accidental logging or display of secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    /// Create a new secret string.
    pub fn new(s: String) -> Self {
        Self(s)
    }

    /// Get the underlying secret value.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

/// Connection options for [`StreamClient`](crate::client::StreamClient).
///
/// There is deliberately no overall request timeout: a query stream stays open
/// until the backend closes it or the caller cancels.
///
/// # Example
/// ```rust
/// use paperchat::options::ClientOptions;
/// use std::time::Duration;
///
/// let options = ClientOptions::new("http://research.internal:8000/")
///     .with_connect_timeout(Duration::from_secs(5))
///     .with_header("X-Client".to_string(), "paperchat".to_string());
///
/// assert_eq!(options.query_url(), "http://research.internal:8000/query");
/// ```
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Base URL of the backend, without the endpoint path
    pub base_url: String,

    /// Path of the streaming query endpoint
    pub query_path: String,

    /// Path of the liveness endpoint
    pub health_path: String,

    /// Timeout for establishing the TCP/TLS connection
    pub connect_timeout: Option<Duration>,

    /// Optional bearer token sent as `Authorization`
    pub api_key: Option<SecretString>,

    /// HTTP proxy URL
    pub proxy: Option<String>,

    /// Additional HTTP headers to include in requests
    pub extra_headers: Option<HashMap<String, String>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl ClientOptions {
    /// Create options for the backend at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            query_path: DEFAULT_QUERY_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            connect_timeout: None,
            api_key: None,
            proxy: None,
            extra_headers: None,
        }
    }

    /// Read options from `PAPERCHAT_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::new(lookup(ENV_BASE_URL).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()));

        if let Some(raw) = lookup(ENV_CONNECT_TIMEOUT) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => options.connect_timeout = Some(Duration::from_secs(secs)),
                Err(e) => warn!("Ignoring {}={:?}: {}", ENV_CONNECT_TIMEOUT, raw, e),
            }
        }

        options.proxy = lookup(ENV_PROXY).filter(|p| !p.is_empty());
        options.api_key = lookup(ENV_API_KEY)
            .filter(|k| !k.is_empty())
            .map(SecretString::new);

        options
    }

    /// Full URL of the streaming query endpoint.
    pub fn query_url(&self) -> String {
        self.endpoint(&self.query_path)
    }

    /// Full URL of the liveness endpoint.
    pub fn health_url(&self) -> String {
        self.endpoint(&self.health_path)
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Set the query endpoint path.
    pub fn with_query_path(mut self, path: String) -> Self {
        self.query_path = path;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<SecretString>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set extra headers.
    pub fn with_extra_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.extra_headers = Some(headers);
        self
    }

    /// Add a single extra header.
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.extra_headers
            .get_or_insert_with(HashMap::new)
            .insert(key, value);
        self
    }
}
