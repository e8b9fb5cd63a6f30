//! # Media Cache Core
//!
//! Range-addressable disk cache for large media resources.
//!
//! ## Overview
//!
//! This crate handles:
//! - Persisting arbitrary byte ranges of a resource and answering what is cached
//! - Fetching only the uncached parts of a requested range over HTTP
//! - Keeping entries alive while in use and deferring their deletion
//! - Prefetching resource prefixes ahead of playback, one at a time
//! - Trimming the cache to its cost limit, least recently used first

pub mod delete_manager;
pub mod error;
pub mod fetch;
pub mod key;
pub mod play_session;
pub mod prefetch;
pub mod range_set;
mod report;
pub mod stats;
pub mod store;
pub mod trimmer;

pub use delete_manager::{DeleteManager, DeletionOutcome, EntryRemover, UseGuard};
pub use error::{CacheError, CacheErrorKind, Result};
pub use fetch::{
    DataOrigin, FetchContext, FetchEvent, FetchHandle, FetchOutcome, FetchState, RangeFetchTask,
    RequestRange, PLAYBACK_PRIORITY,
};
pub use key::CacheKey;
pub use play_session::PlaySession;
pub use prefetch::{
    EnqueueOutcome, PrefetchHit, PrefetchHitRecorder, PrefetchIntent, PrefetchScheduler,
    PrefetchState, DEFAULT_GROUP,
};
pub use range_set::{ByteRange, RangeSet};
pub use stats::{CacheStats, DownloadMeter};
pub use store::{CacheInfo, CacheMetadataInfo, CacheStore, ClearReport, FinishSummary};
pub use trimmer::{TrimReport, Trimmer};
