//! HTTP transport for the chat-streaming endpoint.
//!
//! This module provides reqwest client construction and a [`Transport`]
//! implementation on top of it.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use std::collections::HashMap;
use tracing::debug;

use crate::client::{ByteStream, ClientError, StreamRequest, Transport};
use crate::options::TransportOptions;

/// Build a configured HTTP client from transport options.
///
/// Connecting is bounded by `request_timeout`, the whole exchange
/// including the streamed body by `stream_timeout`.
///
/// # Example
/// ```ignore
/// let client = build_http_client(&transport_options)?;
/// ```
pub fn build_http_client(transport_options: &TransportOptions) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .connect_timeout(transport_options.request_timeout)
        .timeout(transport_options.stream_timeout);

    if let Some(proxy_url) = &transport_options.proxy {
        if let Ok(proxy) = reqwest::Proxy::all(proxy_url) {
            builder = builder.proxy(proxy);
        }
    }

    builder.build()
}

/// Add extra headers to a request if specified in transport options.
///
/// # Example
/// ```ignore
/// let mut req = client.post(url);
/// req = add_extra_headers(req, &transport_options.extra_headers);
/// ```
pub fn add_extra_headers(
    mut request: RequestBuilder,
    extra_headers: &Option<HashMap<String, String>>,
) -> RequestBuilder {
    if let Some(headers) = extra_headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
}

/// [`Transport`] over a reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    extra_headers: Option<HashMap<String, String>>,
}

impl HttpTransport {
    pub fn new(transport_options: &TransportOptions) -> Result<Self, ClientError> {
        Ok(Self {
            client: build_http_client(transport_options)?,
            extra_headers: transport_options.extra_headers.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: StreamRequest) -> Result<ByteStream, ClientError> {
        let headers = request.headers()?;
        let mut req = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(headers);
        req = add_extra_headers(req, &self.extra_headers);

        let response = req.json(&request.body).send().await?;
        let status = response.status();
        debug!(%status, url = %request.url, "chat stream response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ClientError::from)),
        ))
    }
}
