//! HTTP Client Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpRequest, ResponseHead, StreamingResponse},
};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{header, Client};
use std::time::Duration;
use tracing::{debug, warn};

/// Reqwest-based HTTP client implementation
///
/// Provides:
/// - Connection pooling via reqwest
/// - `Range` requests with streamed bodies
/// - TLS via rustls
///
/// There is no retry loop here. A failed range fetch is reported to the
/// cache's caller, which decides whether to try again or switch URLs.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Create a new HTTP client with default configuration
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a new HTTP client with a custom connect timeout.
    ///
    /// No overall request timeout is set: a whole-file prefetch may stream for
    /// minutes.
    pub fn with_connect_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(10)
            .user_agent(concat!("media-cache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Create a new HTTP client with custom configuration
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build_request(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut req = self.client.get(&request.url);

        for (key, value) in &request.headers {
            req = req.header(key, value);
        }

        if let Some(range) = request.range_header_value() {
            req = req.header(header::RANGE, range);
        }

        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        req
    }

    fn map_transport_error(e: reqwest::Error) -> BridgeError {
        if e.is_timeout() {
            BridgeError::Transport("Request timed out".to_string())
        } else if e.is_connect() {
            BridgeError::Transport(format!("Connection failed: {}", e))
        } else {
            BridgeError::Transport(e.to_string())
        }
    }

    fn response_head(response: &reqwest::Response) -> ResponseHead {
        response.headers().iter().fold(
            ResponseHead::new(response.status().as_u16(), response.url().as_str()),
            |head, (name, value)| match value.to_str() {
                Ok(value) => head.with_header(name.as_str(), value),
                Err(_) => head,
            },
        )
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<StreamingResponse> {
        debug!(
            url = %request.url,
            range = ?request.range,
            "Sending ranged HTTP request"
        );

        let response = self
            .build_request(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, url = %request.url, "HTTP request failed");
                Self::map_transport_error(e)
            })?;

        let head = Self::response_head(&response);
        debug!(
            status = head.status,
            content_range = ?head.header("content-range"),
            "Received response head"
        );

        let body = response
            .bytes_stream()
            .map_err(Self::map_transport_error)
            .boxed();

        Ok(StreamingResponse { head, body })
    }
}
