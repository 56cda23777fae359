//! Options structures for the chat endpoint and the streaming transport.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default path of the chat-streaming endpoint, relative to the base URL.
pub const DEFAULT_STREAM_PATH: &str = "/chat/stream";

/// Default number of retrieved items the backend should ground an answer on.
pub const DEFAULT_TOP_K: u32 = 10;

/// Bound on establishing the request (until response headers arrive).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on the whole streamed body.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// A secret string type for sensitive data like bearer tokens.
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

/// Options describing which endpoint to talk to and what to ask of it.
///
/// # Example
/// ```rust
/// use pookie_chat::options::ChatOptions;
///
/// let options = ChatOptions::new("https://api.example.com")
///     .with_top_k(5);
/// assert_eq!(options.stream_url(), "https://api.example.com/chat/stream");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatOptions {
    /// Base URL of the backend (e.g., "https://api.example.com")
    pub base_url: String,

    /// Path of the streaming endpoint
    pub stream_path: String,

    /// Result-count hint sent as `top_k`
    pub top_k: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            top_k: DEFAULT_TOP_K,
        }
    }
}

impl ChatOptions {
    /// Create chat options for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Set the endpoint path.
    pub fn with_stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    /// Set the result-count hint.
    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = top_k;
        self
    }

    /// Full URL of the streaming endpoint.
    pub fn stream_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.stream_path.trim_start_matches('/')
        )
    }
}

/// Transport configuration: timeouts, proxy and extra headers.
///
/// `request_timeout` bounds establishing the request (until headers are
/// received); `stream_timeout` bounds the streamed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Bound on request establishment
    pub request_timeout: Duration,

    /// Bound on the streamed body, measured from establishment
    pub stream_timeout: Duration,

    /// HTTP proxy URL
    pub proxy: Option<String>,

    /// Additional HTTP headers to include in requests
    pub extra_headers: Option<HashMap<String, String>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            proxy: None,
            extra_headers: None,
        }
    }
}

impl TransportOptions {
    /// Create transport options with the default timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request-establishment timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the streamed-body timeout.
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
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
