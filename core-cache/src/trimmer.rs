//! # Eviction / Quota Trimmer
//!
//! Keeps the cache under its cost limit by deleting the least recently used
//! entries that nobody is using, and answers the free-space questions that
//! gate new downloads.

use crate::delete_manager::DeletionOutcome;
use crate::error::Result;
use crate::key::CacheKey;
use crate::stats::format_bytes;
use crate::store::CacheStore;
use bridge_traits::storage::FileSystemAccess;
use core_runtime::config::SharedSettings;
use core_runtime::events::{CacheEvent, StoreEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often a disabled auto-trim loop checks whether it was re-enabled.
const DISABLED_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

const MIB: u64 = 1024 * 1024;

/// Outcome of one trim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub removed: Vec<CacheKey>,
    pub bytes_freed: u64,
    pub remaining_bytes: u64,
    /// `false` when the pass ran out of evictable entries above the limit.
    pub within_limit: bool,
}

/// One bounded pass over a snapshot of the entries. Never touches keys in
/// use and never adds bytes.
pub(crate) fn trim_store(store: &CacheStore, limit: u64) -> TrimReport {
    let mut report = TrimReport {
        remaining_bytes: store.total_size(),
        within_limit: true,
        ..TrimReport::default()
    };
    if report.remaining_bytes <= limit {
        return report;
    }

    let manager = store.delete_manager();
    let active = manager.active_keys();
    let mut candidates: Vec<_> = store
        .entries()
        .into_iter()
        .filter(|entry| !active.contains(&entry.key))
        .collect();
    candidates.sort_by(|a, b| {
        a.last_access_at
            .cmp(&b.last_access_at)
            .then(a.created_at.cmp(&b.created_at))
    });

    let mut total = report.remaining_bytes;
    for candidate in candidates {
        if total <= limit {
            break;
        }
        match manager.mark_for_deletion(&candidate.key) {
            Ok(DeletionOutcome::Deleted { bytes_freed }) => {
                total = total.saturating_sub(bytes_freed);
                report.bytes_freed += bytes_freed;
                report.removed.push(candidate.key);
            }
            Ok(DeletionOutcome::Deferred { users }) => {
                // Picked up a user after the snapshot; it is deleted on release.
                debug!(key = %candidate.key, users, "Eviction deferred");
            }
            Err(e) => warn!(key = %candidate.key, error = %e, "Eviction failed"),
        }
    }

    report.remaining_bytes = store.total_size();
    report.within_limit = report.remaining_bytes <= limit;
    let events = store.events();
    if !report.within_limit {
        let in_use = manager.active_keys().len();
        warn!(
            total = %format_bytes(report.remaining_bytes),
            limit = %format_bytes(limit),
            in_use,
            "Cache over quota with no evictable entries left"
        );
        events
            .emit(CacheEvent::Store(StoreEvent::QuotaUnreachable {
                total_bytes: report.remaining_bytes,
                cost_limit: limit,
                in_use,
            }))
            .ok();
    }
    info!(
        removed = report.removed.len(),
        freed = %format_bytes(report.bytes_freed),
        remaining = %format_bytes(report.remaining_bytes),
        "Cache trimmed"
    );
    events
        .emit(CacheEvent::Store(StoreEvent::Trimmed {
            removed: report.removed.len(),
            bytes_freed: report.bytes_freed,
            remaining_bytes: report.remaining_bytes,
        }))
        .ok();
    report
}

/// Quota enforcement and disk-space policy for one store.
pub struct Trimmer {
    store: Arc<CacheStore>,
    file_system: Arc<dyn FileSystemAccess>,
    settings: SharedSettings,
}

impl Trimmer {
    pub fn new(
        store: Arc<CacheStore>,
        file_system: Arc<dyn FileSystemAccess>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            store,
            file_system,
            settings,
        }
    }

    /// Trim to the configured cost limit.
    pub fn trim_to_quota(&self) -> TrimReport {
        self.store.trim_to_size(self.settings.cost_limit_bytes())
    }

    /// Free bytes on the file system holding the cache.
    pub async fn free_file_system_size(&self) -> Result<u64> {
        Ok(self.file_system.available_space(self.store.root()).await?)
    }

    pub async fn free_file_system_size_mb(&self) -> Result<u64> {
        Ok(self.free_file_system_size().await? / MIB)
    }

    pub async fn total_file_system_size(&self) -> Result<u64> {
        Ok(self.file_system.total_space(self.store.root()).await?)
    }

    /// Whether free space is at or above the configured floor.
    pub async fn has_enough_free_disk_size(&self) -> Result<bool> {
        Ok(self.free_file_system_size().await? >= self.settings.min_free_disk_bytes())
    }

    /// Whether playback of `media_duration` can run without stalling: the
    /// cached prefix plus what `network_speed_kbps` (KiB/s) downloads in that
    /// time reaches the end of the resource.
    pub fn has_enough_cache_for(
        &self,
        key: &CacheKey,
        media_duration: Duration,
        network_speed_kbps: f64,
    ) -> bool {
        has_enough_cache(&self.store, key, media_duration, network_speed_kbps)
    }

    /// Run [`trim_to_quota`](Self::trim_to_quota) every
    /// `auto_trim_interval` until `cancel` fires. The interval is re-read
    /// after every pass.
    pub fn spawn_auto_trim(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval = self.settings.read(|s| s.auto_trim_interval);
                let enabled = !interval.is_zero();
                let wait = if enabled {
                    interval
                } else {
                    DISABLED_RECHECK_INTERVAL
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if enabled && !self.settings.read(|s| s.auto_trim_interval).is_zero() {
                    self.trim_to_quota();
                }
            }
            debug!("Auto trim stopped");
        })
    }
}

pub(crate) fn has_enough_cache(
    store: &CacheStore,
    key: &CacheKey,
    media_duration: Duration,
    network_speed_kbps: f64,
) -> bool {
    let Some(meta) = store.snapshot(key) else {
        return false;
    };
    if meta.is_complete() {
        return true;
    }
    let Some(total) = meta.total_length else {
        return false;
    };
    let prefix = meta.cached_ranges.contiguous_from(0);
    let downloadable = (network_speed_kbps.max(0.0) * 1024.0 * media_duration.as_secs_f64()) as u64;
    prefix.saturating_add(downloadable) >= total
}

impl std::fmt::Debug for Trimmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trimmer")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
