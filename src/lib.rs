//! Workspace umbrella crate.
//!
//! Exposes the feature flags that map to the individual workspace crates so
//! host applications can depend on `media-cache-workspace` alone. With the
//! default `desktop-shims` feature the cache service and its desktop
//! bootstrapper are re-exported here.

#[cfg(feature = "service")]
pub use core_service::*;
