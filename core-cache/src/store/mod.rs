//! # Cache Store
//!
//! Range-addressable storage for partially downloaded resources.
//!
//! Each entry is two files in the cache root:
//!
//! ```text
//! <stem>.data   sparse file, bytes live at their resource offsets
//! <stem>.meta   JSON metadata: length, MIME type, cached ranges, timestamps
//! ```
//!
//! ## Consistency
//!
//! Data is synced before the metadata that claims it is replaced (write to
//! `<stem>.meta.tmp`, then rename), so after a crash the metadata never
//! claims bytes that are not on disk. In memory, every entry holds its
//! metadata snapshot behind a lock that is swapped only after the matching
//! disk write finished; readers never see a half-applied write.
//!
//! Writes to one key are serialised by a per-entry async mutex. Reads of
//! cached ranges do not wait for writers.
//!
//! Every operation holds a use of its key in the [`DeleteManager`] for its
//! duration, so deletion is deferred until the operation is done.

mod data_file;
pub mod metadata;
mod recovery;

pub use metadata::{CacheEntryMetadata, METADATA_VERSION};
pub use recovery::RecoveryReport;

use crate::delete_manager::{DeleteManager, DeletionOutcome, EntryRemover};
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::range_set::{ByteRange, RangeSet};
use crate::report::{extra, report};
use crate::stats::CacheStats;
use crate::trimmer::{self, TrimReport};
use bridge_traits::time::Clock;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_runtime::config::SharedSettings;
use core_runtime::events::{CacheEvent, EventBus, StoreEvent};
use core_runtime::hooks::ReportLabel;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};

/// Summary returned by [`CacheStore::metadata`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetadataInfo {
    pub mime_type: Option<String>,
    pub total_length: Option<u64>,
    /// Sum of cached range lengths.
    pub cached_length: u64,
}

/// Answer to [`CacheStore::query_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub has_cache: bool,
    pub is_complete: bool,
    /// Data file location, when anything is cached.
    pub data_path: Option<PathBuf>,
    pub total_length: Option<u64>,
    pub cached_length: u64,
    pub mime_type: Option<String>,
}

/// What [`CacheStore::finish`] persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishSummary {
    pub key: CacheKey,
    pub cached_bytes: u64,
    pub total_length: Option<u64>,
    pub is_complete: bool,
}

/// Eviction candidate view of one entry.
#[derive(Debug, Clone)]
pub struct EntrySummary {
    pub key: CacheKey,
    pub cached_bytes: u64,
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}

/// Outcome of [`CacheStore::clear`] and [`CacheStore::clear_keys`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub deleted: usize,
    pub deferred: usize,
    pub failed: usize,
    pub bytes_freed: u64,
}

struct EntrySlot {
    write_lock: tokio::sync::Mutex<()>,
    meta: RwLock<CacheEntryMetadata>,
}

impl EntrySlot {
    fn new(meta: CacheEntryMetadata) -> Self {
        Self {
            write_lock: tokio::sync::Mutex::new(()),
            meta: RwLock::new(meta),
        }
    }

    fn snapshot(&self) -> CacheEntryMetadata {
        self.meta.read().clone()
    }
}

/// On-disk cache of byte ranges, keyed by [`CacheKey`].
pub struct CacheStore {
    root: PathBuf,
    index: RwLock<HashMap<CacheKey, Arc<EntrySlot>>>,
    delete_manager: DeleteManager,
    clock: Arc<dyn Clock>,
    settings: SharedSettings,
    events: EventBus,
    recovery: RecoveryReport,
}

impl CacheStore {
    /// Open (or create) the store at `root` and recover its previous state.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(
        root: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        settings: SharedSettings,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            CacheError::CreateFileFailed(format!("{}: {}", root.display(), e))
        })?;
        let (entries, recovery) = recovery::scan(&root, &settings, &events).await?;

        let index = entries
            .into_iter()
            .map(|(key, meta)| (key, Arc::new(EntrySlot::new(meta))))
            .collect();

        Ok(Arc::new_cyclic(|weak: &Weak<CacheStore>| {
            let remover: Weak<dyn EntryRemover> = weak.clone();
            CacheStore {
                root,
                index: RwLock::new(index),
                delete_manager: DeleteManager::new(remover, events.clone()),
                clock,
                settings,
                events,
                recovery,
            }
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn delete_manager(&self) -> &DeleteManager {
        &self.delete_manager
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// What the startup scan found.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.data_file_name())
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.meta_file_name())
    }

    fn slot(&self, key: &CacheKey) -> Option<Arc<EntrySlot>> {
        self.index.read().get(key).cloned()
    }

    fn slot_or_insert(&self, key: &CacheKey) -> Arc<EntrySlot> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        let now = self.clock.now();
        Arc::clone(
            self.index
                .write()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(EntrySlot::new(CacheEntryMetadata::new(key.clone(), now)))),
        )
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store `data` at `offset` and record the range as cached.
    ///
    /// `mime_type` and `total_length` are recorded when first learned. The
    /// data is durable before the metadata claims it.
    #[instrument(skip_all, fields(key = %key, offset = offset, len = data.len()))]
    pub async fn write_range(
        &self,
        key: &CacheKey,
        offset: u64,
        data: &[u8],
        mime_type: Option<&str>,
        total_length: Option<u64>,
    ) -> Result<()> {
        let range = ByteRange::from_offset_len(offset, data.len() as u64).ok_or_else(|| {
            CacheError::InvalidRange(format!("{} + {} overflows", offset, data.len()))
        })?;

        let _use = self.delete_manager.start_use(key);
        let slot = self.slot_or_insert(key);
        let _write = slot.write_lock.lock().await;

        let previous = slot.snapshot();
        let mut next = previous.clone();
        let mut changed = next.apply_info(mime_type, total_length)?;
        if !range.is_empty() {
            next.apply_range(range)?;
            if let Err(e) = data_file::write_at(&self.data_path(key), offset, data).await {
                self.report_io(ReportLabel::WriteFileFail, key, &e);
                return Err(CacheError::WriteFailed(e.to_string()));
            }
            changed = true;
        }
        if !changed {
            return Ok(());
        }

        next.last_access_at = self.clock.now().max(previous.last_access_at);
        self.persist(&next).await?;
        let completed = next.is_complete() && !previous.is_complete();
        let total = next.total_length;
        *slot.meta.write() = next;

        if completed {
            info!(key = %key, total_length = ?total, "Cache entry complete");
            self.events
                .emit(CacheEvent::Store(StoreEvent::EntryCompleted {
                    key: key.to_string(),
                    total_length: total.unwrap_or_default(),
                }))
                .ok();
        }
        Ok(())
    }

    /// Record the resource length and MIME type without writing data.
    pub async fn update_info(
        &self,
        key: &CacheKey,
        mime_type: Option<&str>,
        total_length: Option<u64>,
    ) -> Result<()> {
        self.write_range(key, 0, &[], mime_type, total_length).await
    }

    /// Persist bookkeeping for a finished session.
    #[instrument(skip(self))]
    pub async fn finish(&self, key: &CacheKey, origin_url: Option<&str>) -> Result<FinishSummary> {
        let _use = self.delete_manager.start_use(key);
        let slot = self
            .slot(key)
            .ok_or_else(|| CacheError::MetaNotFound(key.to_string()))?;
        let _write = slot.write_lock.lock().await;

        let mut next = slot.snapshot();
        if let Some(url) = origin_url {
            next.origin_url = Some(url.to_string());
        }
        self.persist(&next).await?;
        let summary = FinishSummary {
            key: key.clone(),
            cached_bytes: next.cached_bytes(),
            total_length: next.total_length,
            is_complete: next.is_complete(),
        };
        *slot.meta.write() = next;
        debug!(?summary, "Cache session finished");
        Ok(summary)
    }

    async fn persist(&self, meta: &CacheEntryMetadata) -> Result<()> {
        let encoded = meta.encode()?;
        let result = data_file::replace_atomic(
            &self.meta_path(&meta.key),
            &self.root.join(meta.key.meta_tmp_file_name()),
            &encoded,
        )
        .await;
        result.map_err(|e| {
            self.report_io(ReportLabel::WriteFileFail, &meta.key, &e);
            CacheError::WriteFailed(e.to_string())
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read `[offset, offset + length)`. Fails with `NotFound` unless every
    /// byte is cached; partial results are never returned.
    #[instrument(skip_all, fields(key = %key, offset = offset, length = length))]
    pub async fn read_range(&self, key: &CacheKey, offset: u64, length: u64) -> Result<Bytes> {
        let _use = self.delete_manager.start_use(key);
        if self.claim_read(key, offset, length)? {
            return Ok(Bytes::new());
        }
        data_file::read_at(&self.data_path(key), offset, length)
            .await
            .map_err(|e| self.read_error(key, e))
    }

    /// Blocking twin of [`read_range`](Self::read_range).
    pub fn read_range_sync(&self, key: &CacheKey, offset: u64, length: u64) -> Result<Bytes> {
        let _use = self.delete_manager.start_use(key);
        if self.claim_read(key, offset, length)? {
            return Ok(Bytes::new());
        }
        data_file::read_at_blocking(&self.data_path(key), offset, length)
            .map_err(|e| self.read_error(key, e))
    }

    /// Check coverage and touch the access time. Returns `true` for an empty
    /// read that needs no I/O.
    fn claim_read(&self, key: &CacheKey, offset: u64, length: u64) -> Result<bool> {
        let not_found = || CacheError::NotFound {
            key: key.to_string(),
            offset,
            length,
        };
        let range = ByteRange::from_offset_len(offset, length).ok_or_else(not_found)?;
        let slot = self.slot(key).ok_or_else(not_found)?;
        let mut meta = slot.meta.write();
        if !meta.cached_ranges.covers(range) {
            return Err(not_found());
        }
        meta.last_access_at = self.clock.now().max(meta.last_access_at);
        Ok(range.is_empty())
    }

    /// Length, MIME type and cached byte count. Also checks the data file is
    /// still there.
    pub async fn metadata(&self, key: &CacheKey) -> Result<CacheMetadataInfo> {
        let (info, cached) = self.metadata_snapshot(key)?;
        if cached && !tokio::fs::try_exists(self.data_path(key)).await.unwrap_or(false) {
            return Err(self.missing_data(key));
        }
        Ok(info)
    }

    /// Blocking twin of [`metadata`](Self::metadata).
    pub fn metadata_sync(&self, key: &CacheKey) -> Result<CacheMetadataInfo> {
        let (info, cached) = self.metadata_snapshot(key)?;
        if cached && !self.data_path(key).try_exists().unwrap_or(false) {
            return Err(self.missing_data(key));
        }
        Ok(info)
    }

    fn metadata_snapshot(&self, key: &CacheKey) -> Result<(CacheMetadataInfo, bool)> {
        let meta = self
            .slot(key)
            .map(|slot| slot.snapshot())
            .ok_or_else(|| CacheError::MetaNotFound(key.to_string()))?;
        let cached_length = meta.cached_bytes();
        Ok((
            CacheMetadataInfo {
                mime_type: meta.mime_type,
                total_length: meta.total_length,
                cached_length,
            },
            cached_length > 0,
        ))
    }

    /// Full metadata record, if the key is known.
    pub fn snapshot(&self, key: &CacheKey) -> Option<CacheEntryMetadata> {
        self.slot(key).map(|slot| slot.snapshot())
    }

    pub fn cached_ranges(&self, key: &CacheKey) -> RangeSet {
        self.snapshot(key)
            .map(|meta| meta.cached_ranges)
            .unwrap_or_default()
    }

    /// Uncached sub-ranges of `window`.
    pub fn gaps(&self, key: &CacheKey, window: ByteRange) -> Vec<ByteRange> {
        match self.slot(key) {
            Some(slot) => slot.meta.read().cached_ranges.gaps(window),
            None if window.is_empty() => Vec::new(),
            None => vec![window],
        }
    }

    pub fn query_info(&self, key: &CacheKey) -> CacheInfo {
        match self.snapshot(key) {
            Some(meta) => {
                let cached_length = meta.cached_bytes();
                CacheInfo {
                    has_cache: cached_length > 0,
                    is_complete: meta.is_complete(),
                    data_path: (cached_length > 0).then(|| self.data_path(key)),
                    total_length: meta.total_length,
                    cached_length,
                    mime_type: meta.mime_type,
                }
            }
            None => CacheInfo {
                has_cache: false,
                is_complete: false,
                data_path: None,
                total_length: None,
                cached_length: 0,
                mime_type: None,
            },
        }
    }

    /// Whether any byte of `key` is cached.
    pub fn has_cache(&self, key: &CacheKey) -> bool {
        self.slot(key)
            .is_some_and(|slot| !slot.meta.read().cached_ranges.is_empty())
    }

    pub fn is_complete(&self, key: &CacheKey) -> bool {
        self.slot(key).is_some_and(|slot| slot.meta.read().is_complete())
    }

    /// Sum of cached bytes across all entries.
    pub fn total_size(&self) -> u64 {
        self.index
            .read()
            .values()
            .map(|slot| slot.meta.read().cached_bytes())
            .sum()
    }

    pub fn entries(&self) -> Vec<EntrySummary> {
        self.index
            .read()
            .values()
            .map(|slot| {
                let meta = slot.meta.read();
                EntrySummary {
                    key: meta.key.clone(),
                    cached_bytes: meta.cached_bytes(),
                    is_complete: meta.is_complete(),
                    created_at: meta.created_at,
                    last_access_at: meta.last_access_at,
                }
            })
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries();
        CacheStats {
            entries: entries.len(),
            complete_entries: entries.iter().filter(|e| e.is_complete).count(),
            in_use: self.delete_manager.active_keys().len(),
            total_bytes: entries.iter().map(|e| e.cached_bytes).sum(),
            cost_limit_bytes: self.settings.cost_limit_bytes(),
            calculated_at: self.clock.now().timestamp(),
        }
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Delete every entry; entries in use go when released.
    #[instrument(skip(self))]
    pub fn clear(&self) -> ClearReport {
        let keys: Vec<CacheKey> = self.index.read().keys().cloned().collect();
        let report = self.clear_keys(&keys);
        info!(?report, "Cache cleared");
        report
    }

    pub fn clear_keys(&self, keys: &[CacheKey]) -> ClearReport {
        let mut report = ClearReport::default();
        for key in keys {
            match self.delete_manager.mark_for_deletion(key) {
                Ok(DeletionOutcome::Deleted { bytes_freed }) => {
                    report.deleted += 1;
                    report.bytes_freed += bytes_freed;
                }
                Ok(DeletionOutcome::Deferred { .. }) => report.deferred += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to delete cache entry");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Evict least recently used entries until the total is at most `limit`.
    pub fn trim_to_size(&self, limit: u64) -> TrimReport {
        trimmer::trim_store(self, limit)
    }

    // ========================================================================
    // Reporting helpers
    // ========================================================================

    fn report_io(&self, label: ReportLabel, key: &CacheKey, error: &io::Error) {
        warn!(key = %key, error = %error, %label, "Cache file I/O failed");
        report(
            &self.settings,
            &self.events,
            label,
            key.as_str(),
            extra!("error" => error),
        );
    }

    fn missing_data(&self, key: &CacheKey) -> CacheError {
        report(
            &self.settings,
            &self.events,
            ReportLabel::CacheDataCorrupted,
            key.as_str(),
            extra!("reason" => "data file missing"),
        );
        CacheError::DataFileMissing(key.to_string())
    }

    fn read_error(&self, key: &CacheKey, error: io::Error) -> CacheError {
        match error.kind() {
            io::ErrorKind::NotFound => self.missing_data(key),
            io::ErrorKind::UnexpectedEof => {
                report(
                    &self.settings,
                    &self.events,
                    ReportLabel::CacheDataCorrupted,
                    key.as_str(),
                    extra!("reason" => "data file shorter than metadata"),
                );
                CacheError::ReadFailed(error.to_string())
            }
            _ => {
                self.report_io(ReportLabel::ReadFileFail, key, &error);
                CacheError::ReadFailed(error.to_string())
            }
        }
    }
}

impl EntryRemover for CacheStore {
    fn remove_entry(&self, key: &CacheKey) -> io::Result<u64> {
        data_file::remove_if_exists(&self.meta_path(key))?;
        data_file::remove_if_exists(&self.data_path(key))?;
        let removed = self.index.write().remove(key);
        let bytes_freed = removed.map_or(0, |slot| slot.meta.read().cached_bytes());
        debug!(key = %key, bytes_freed, "Removed cache entry files");
        Ok(bytes_freed)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("root", &self.root)
            .field("entries", &self.index.read().len())
            .finish_non_exhaustive()
    }
}
