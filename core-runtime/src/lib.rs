//! # Core Runtime Module
//!
//! Process-wide infrastructure shared by the media cache:
//! - Configuration and runtime-mutable cache settings
//! - Observer hooks (reporter, download activity, CDN requests, prefetch hits)
//! - Event bus
//! - Logging and tracing, including the optional rolling file log

pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod logging;

pub use error::{Error, Result};
