//! # Event Bus System
//!
//! Broadcasts what the cache does using `tokio::sync::broadcast`. This is the
//! message-passing side of observation: hosts that prefer polling a channel to
//! registering callbacks subscribe here.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     emit      ┌───────────┐
//! │ CacheStore   ├──────────────>│           │
//! └──────────────┘               │           │     subscribe    ┌────────────┐
//! ┌──────────────┐     emit      │ EventBus  ├─────────────────>│ Subscriber │
//! │ Prefetcher   ├──────────────>│ (broadcast│                  └────────────┘
//! └──────────────┘               │  channel) │     subscribe    ┌────────────┐
//! ┌──────────────┐     emit      │           ├─────────────────>│ Subscriber │
//! │ Trimmer      ├──────────────>│           │                  └────────────┘
//! └──────────────┘               └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CacheEvent, EventBus, StoreEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut subscriber = bus.subscribe();
//!
//! bus.emit(CacheEvent::Store(StoreEvent::EntryDeleted {
//!     key: "abc".to_string(),
//!     bytes_freed: 4096,
//! }))
//! .ok();
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.description(), "Cache entry deleted");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events and may continue.
//! - **`RecvError::Closed`**: every sender was dropped; treat as shutdown.
//!
//! Emitting with no subscribers is not an error for the cache; callers ignore
//! the `SendError`.

use crate::hooks::{ReportExtra, ReportLabel};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Cache Event Types
// ============================================================================

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CacheEvent {
    Store(StoreEvent),
    Prefetch(PrefetchEvent),
    /// Mirror of every reporter call
    Report(ReportEvent),
}

impl CacheEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CacheEvent::Store(e) => e.description(),
            CacheEvent::Prefetch(e) => e.description(),
            CacheEvent::Report(_) => "Operational report",
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CacheEvent::Prefetch(PrefetchEvent::Failed { .. }) => EventSeverity::Error,
            CacheEvent::Report(ReportEvent { label, .. }) => match label {
                ReportLabel::CachedSizeWhenPlay | ReportLabel::CachePlayCdnUrl => {
                    EventSeverity::Info
                }
                _ => EventSeverity::Error,
            },
            CacheEvent::Store(StoreEvent::QuotaUnreachable { .. }) => EventSeverity::Warning,
            CacheEvent::Store(StoreEvent::Trimmed { .. })
            | CacheEvent::Store(StoreEvent::EntryCompleted { .. })
            | CacheEvent::Prefetch(PrefetchEvent::Finished { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Store Events
// ============================================================================

/// Changes to what is on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum StoreEvent {
    /// Every byte of the resource is now cached.
    EntryCompleted { key: String, total_length: u64 },
    /// Metadata and data file were removed.
    EntryDeleted { key: String, bytes_freed: u64 },
    /// Deletion requested while the key was in use; it runs on last release.
    DeletionDeferred { key: String, users: usize },
    /// A trim pass finished.
    Trimmed {
        removed: usize,
        bytes_freed: u64,
        remaining_bytes: u64,
    },
    /// Still over quota, but every remaining entry is in use.
    QuotaUnreachable {
        total_bytes: u64,
        cost_limit: u64,
        in_use: usize,
    },
}

impl StoreEvent {
    pub fn description(&self) -> &str {
        match self {
            StoreEvent::EntryCompleted { .. } => "Cache entry fully downloaded",
            StoreEvent::EntryDeleted { .. } => "Cache entry deleted",
            StoreEvent::DeletionDeferred { .. } => "Cache entry deletion deferred while in use",
            StoreEvent::Trimmed { .. } => "Cache trimmed to quota",
            StoreEvent::QuotaUnreachable { .. } => "Cache over quota with nothing evictable",
        }
    }
}

// ============================================================================
// Prefetch Events
// ============================================================================

/// Prefetch intent lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PrefetchEvent {
    Queued {
        key: String,
        group: String,
        size: Option<u64>,
    },
    Started {
        key: String,
        group: String,
    },
    Finished {
        key: String,
        group: String,
        cached_bytes: u64,
    },
    Failed {
        key: String,
        group: String,
        message: String,
    },
    Canceled {
        key: String,
        group: String,
    },
    /// The queue is holding work back because the network is metered.
    Gated { pending: usize },
}

impl PrefetchEvent {
    pub fn description(&self) -> &str {
        match self {
            PrefetchEvent::Queued { .. } => "Prefetch queued",
            PrefetchEvent::Started { .. } => "Prefetch started",
            PrefetchEvent::Finished { .. } => "Prefetch finished",
            PrefetchEvent::Failed { .. } => "Prefetch failed",
            PrefetchEvent::Canceled { .. } => "Prefetch canceled",
            PrefetchEvent::Gated { .. } => "Prefetch paused on metered network",
        }
    }

    /// Key the event is about, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            PrefetchEvent::Queued { key, .. }
            | PrefetchEvent::Started { key, .. }
            | PrefetchEvent::Finished { key, .. }
            | PrefetchEvent::Failed { key, .. }
            | PrefetchEvent::Canceled { key, .. } => Some(key),
            PrefetchEvent::Gated { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PrefetchEvent::Finished { .. }
                | PrefetchEvent::Failed { .. }
                | PrefetchEvent::Canceled { .. }
        )
    }
}

/// Reporter call mirrored onto the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportEvent {
    pub label: ReportLabel,
    pub resource_id: String,
    pub extra: ReportExtra,
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// A subscriber that falls more than `capacity` events behind receives
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: CacheEvent) -> Result<usize, SendError<CacheEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
