//! HTTP Client Abstraction
//!
//! Streaming GET requests with optional byte ranges. The cache never buffers a
//! whole response; bodies are handed over as a [`ByteStream`] and written to
//! disk chunk by chunk.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use crate::error::Result;

/// Body of a streaming response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// GET request builder
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Requested byte span, `start` inclusive and `end` exclusive.
    /// `None` for `end` means "to the end of the resource".
    pub range: Option<(u64, Option<u64>)>,
    pub timeout: Option<Duration>,
    /// Scheduling hint in `0.0..=1.0`. Hosts that cannot prioritise ignore it.
    pub priority: f32,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            range: None,
            timeout: None,
            priority: 0.5,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Request `[start, end)`, or everything from `start` when `end` is `None`.
    pub fn range(mut self, start: u64, end: Option<u64>) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn priority(mut self, priority: f32) -> Self {
        self.priority = priority.clamp(0.0, 1.0);
        self
    }

    /// Value for the `Range` header, if a range was requested.
    ///
    /// HTTP ranges are inclusive, so `[0, 100)` becomes `bytes=0-99`.
    pub fn range_header_value(&self) -> Option<String> {
        match self.range? {
            (start, Some(end)) if end > start => Some(format!("bytes={}-{}", start, end - 1)),
            (start, _) => Some(format!("bytes={}-", start)),
        }
    }
}

/// Parsed `Content-Range: bytes a-b/total` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// Inclusive, as on the wire.
    pub end: u64,
    /// `None` when the server sent `*`.
    pub total: Option<u64>,
}

/// Parse a `Content-Range` header value.
///
/// Accepts `bytes 0-99/500`, `bytes 0-99/*` and returns `None` for
/// unsatisfied-range forms such as `bytes */500`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

/// Status line and headers of a response, available before the body.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    /// Header names are stored lower-cased.
    pub headers: HashMap<String, String>,
    /// URL after redirects.
    pub final_url: String,
}

impl ResponseHead {
    pub fn new(status: u16, final_url: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            final_url: final_url.into(),
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Check if response status is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `206 Partial Content`
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        parse_content_range(self.header("content-range")?)
    }

    /// Full length of the resource, as far as this response reveals it.
    pub fn total_length(&self) -> Option<u64> {
        if let Some(range) = self.content_range() {
            return range.total;
        }
        if self.status == 200 {
            return self.content_length();
        }
        None
    }

    /// Length carried by an unsatisfied-range reply, `Content-Range: bytes */N`.
    pub fn unsatisfied_length(&self) -> Option<u64> {
        let value = self.header("content-range")?.trim().strip_prefix("bytes")?;
        value.trim_start().strip_prefix("*/")?.trim().parse().ok()
    }

    /// Offset of the first body byte within the resource.
    pub fn body_offset(&self) -> u64 {
        if self.is_partial() {
            self.content_range().map(|r| r.start).unwrap_or(0)
        } else {
            0
        }
    }
}

/// A response whose body has not been read yet
pub struct StreamingResponse {
    pub head: ResponseHead,
    pub body: ByteStream,
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Async HTTP client trait
///
/// Implementations must not retry on their own: the cache reports network
/// failures to its caller, which owns the retry policy.
///
/// Non-2xx statuses are returned as `Ok` responses so the caller can report
/// them; only transport failures are errors.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest};
///
/// async fn first_kilobyte(client: &dyn HttpClient, url: &str) -> Result<ResponseHead> {
///     let response = client.send(HttpRequest::get(url).range(0, Some(1024))).await?;
///     Ok(response.head)
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send a request and return as soon as the response head arrives.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`](crate::error::BridgeError::Transport)
    /// if the connection fails or times out.
    async fn send(&self, request: HttpRequest) -> Result<StreamingResponse>;
}
