//! # Desktop Bridge Implementations
//!
//! Default implementations of the cache's bridge traits for desktop platforms
//! (macOS, Windows, Linux):
//! - `HttpClient` using `reqwest` with `Range` requests and streamed bodies
//! - `FileSystemAccess` using `tokio::fs`, `dirs` and `fs2` for free space
//! - `NetworkMonitor` using a polling connectivity probe
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopNetworkMonitor, ReqwestHttpClient, TokioFileSystem};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let fs = TokioFileSystem::new();
//!     let network = DesktopNetworkMonitor::new();
//!     // Hand these to the cache configuration
//!     Ok(())
//! }
//! ```

mod filesystem;
mod http;
mod network;

pub use filesystem::TokioFileSystem;
pub use http::ReqwestHttpClient;
pub use network::DesktopNetworkMonitor;
