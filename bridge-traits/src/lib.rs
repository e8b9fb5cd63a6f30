//! # Host Bridge Traits
//!
//! Capabilities the media cache needs from its host but does not implement
//! itself.
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Ranged, streaming GET requests
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Cache directory location and free space
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity and metered network detection
//! - [`Clock`](time::Clock) - Time source, replaceable in tests
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop  | `bridge-desktop`    | ✅ In Progress |
//! | iOS      | TBD                 | 📋 Planned |
//! | Android  | TBD                 | 📋 Planned |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should map transport problems to [`BridgeError::Transport`] so the cache can
//! tell a dropped connection apart from a local I/O failure.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`; the cache shares one instance of
//! each across every fetch and prefetch task.
//!
//! ## Examples
//!
//! ```ignore
//! use bridge_traits::http::{HttpClient, HttpRequest};
//!
//! async fn head_of(client: &dyn HttpClient, url: &str) -> Result<u16> {
//!     let response = client.send(HttpRequest::get(url).range(0, Some(1024))).await?;
//!     Ok(response.head.status)
//! }
//! ```

pub mod error;
pub mod http;
pub mod network;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{ByteStream, HttpClient, HttpRequest, ResponseHead, StreamingResponse};
pub use network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use storage::FileSystemAccess;
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
