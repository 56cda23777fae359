//! Chat client, collaborator traits and error types.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::model::ChatRequest;
use crate::options::{ChatOptions, SecretString, TransportOptions};
use crate::sse::{SseEvent, SseStreamExt};

/// Media type of the streamed response body.
pub const EVENT_STREAM: &str = "text/event-stream";

/// Errors that can occur while establishing or reading a chat stream.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Authentication required")]
    AuthRequired,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: &'static str, after: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Raw body chunks of a streaming response. Dropping the stream aborts
/// the underlying request.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>;

/// Source of the bearer credential for chat requests.
///
/// # Example
/// ```rust,ignore
/// struct SessionStore { /* ... */ }
///
/// #[async_trait]
/// impl CredentialProvider for SessionStore {
///     async fn token(&self) -> Result<SecretString, ClientError> {
///         self.current_session()
///             .map(|s| s.access_token.clone())
///             .ok_or(ClientError::AuthRequired)
///     }
/// }
/// ```
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current access token, or [`ClientError::AuthRequired`] when no valid
    /// session exists.
    async fn token(&self) -> Result<SecretString, ClientError>;
}

/// A fixed token, for tools and tests.
#[derive(Debug, Clone)]
pub struct StaticToken(pub SecretString);

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn token(&self) -> Result<SecretString, ClientError> {
        Ok(self.0.clone())
    }
}

/// Opens streaming requests.
///
/// `open` resolves once response headers are received; the body is then
/// delivered through the returned [`ByteStream`]. Implementations report a
/// non-success status as [`ClientError::Status`] from `open`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: StreamRequest) -> Result<ByteStream, ClientError>;
}

/// Descriptor of one chat-streaming request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub method: Method,
    pub url: String,
    pub bearer: SecretString,
    pub body: ChatRequest,
}

impl StreamRequest {
    pub fn new(url: String, bearer: SecretString, body: ChatRequest) -> Self {
        Self {
            method: Method::POST,
            url,
            bearer,
            body,
        }
    }

    /// Authorization, Accept and Content-Type headers for this request.
    pub fn headers(&self) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.bearer.expose_secret()))
                .map_err(|_| ClientError::Config("Invalid bearer token".to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

/// Client for the chat-streaming endpoint.
///
/// Combines a [`Transport`] and a [`CredentialProvider`] with the endpoint
/// and timeout options.
///
/// # Example
/// ```no_run
/// use futures::StreamExt;
/// use pookie_chat::client::{ChatClient, StaticToken};
/// use pookie_chat::http::HttpTransport;
/// use pookie_chat::options::{ChatOptions, TransportOptions};
///
/// # async fn run() -> Result<(), pookie_chat::ClientError> {
/// let transport_options = TransportOptions::new();
/// let client = ChatClient::new(
///     ChatOptions::new("https://api.example.com"),
///     transport_options.clone(),
///     HttpTransport::new(&transport_options)?,
///     StaticToken("token".into()),
/// );
///
/// let events = client.chat_stream("What fitness goals have I set?").await?;
/// futures::pin_mut!(events);
/// while let Some(event) = events.next().await {
///     println!("{:?}", event?);
/// }
/// # Ok(())
/// # }
/// ```
pub struct ChatClient<T, C> {
    chat_options: ChatOptions,
    transport_options: TransportOptions,
    transport: T,
    credentials: C,
}

impl<T: Transport, C: CredentialProvider> ChatClient<T, C> {
    pub fn new(
        chat_options: ChatOptions,
        transport_options: TransportOptions,
        transport: T,
        credentials: C,
    ) -> Self {
        Self {
            chat_options,
            transport_options,
            transport,
            credentials,
        }
    }

    pub fn chat_options(&self) -> &ChatOptions {
        &self.chat_options
    }

    pub fn transport_options(&self) -> &TransportOptions {
        &self.transport_options
    }

    /// Build the request descriptor for a query.
    pub async fn build_request(&self, query: &str) -> Result<StreamRequest, ClientError> {
        let body = ChatRequest::new(query, self.chat_options.top_k)?;
        let bearer = self.credentials.token().await?;
        Ok(StreamRequest::new(
            self.chat_options.stream_url(),
            bearer,
            body,
        ))
    }

    /// Open the stream for a query and return its raw body.
    ///
    /// Establishment is bounded by `request_timeout`; the returned stream
    /// yields a [`ClientError::Timeout`] once `stream_timeout` has elapsed.
    pub async fn open(&self, query: &str) -> Result<ByteStream, ClientError> {
        let request = self.build_request(query).await?;
        debug!(url = %request.url, top_k = request.body.top_k, "opening chat stream");

        let request_timeout = self.transport_options.request_timeout;
        let body = tokio::time::timeout(request_timeout, self.transport.open(request))
            .await
            .map_err(|_| ClientError::Timeout {
                phase: "request",
                after: request_timeout,
            })??;

        info!("chat stream established");
        Ok(with_deadline(body, self.transport_options.stream_timeout))
    }

    /// Open the stream for a query and decode it into events.
    pub async fn chat_stream(
        &self,
        query: &str,
    ) -> Result<impl Stream<Item = Result<SseEvent, ClientError>> + Send, ClientError> {
        Ok(self.open(query).await?.sse_events())
    }
}

/// Bound a byte stream by a total duration. Once elapsed, the stream yields
/// one [`ClientError::Timeout`] and ends.
fn with_deadline(body: ByteStream, after: Duration) -> ByteStream {
    let deadline = Instant::now() + after;
    Box::pin(stream::unfold(Some(body), move |body| async move {
        let mut body = body?;
        match tokio::time::timeout_at(deadline, body.next()).await {
            Ok(Some(item)) => Some((item, Some(body))),
            Ok(None) => None,
            Err(_) => Some((
                Err(ClientError::Timeout {
                    phase: "stream",
                    after,
                }),
                None,
            )),
        }
    }))
}
