//! # Delete Manager
//!
//! Reference-counted use registry that keeps entries alive while anything is
//! reading, writing or fetching them.
//!
//! A deletion requested for a key with active users is recorded as pending
//! and carried out by whoever releases the last use. Acquisition is scoped:
//! [`DeleteManager::start_use`] returns a [`UseGuard`] and the use ends when
//! the guard drops, so early returns and task cancellation cannot leak a
//! count.
//!
//! Files are removed outside the registry lock. While a key's files are
//! being removed, `start_use` for that key blocks until the removal is done;
//! other keys are unaffected.

use crate::key::CacheKey;
use core_runtime::events::{CacheEvent, EventBus, StoreEvent};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Physically removes an entry's files. Implemented by the store.
pub trait EntryRemover: Send + Sync {
    /// Remove metadata and data for `key`, returning the cached bytes freed.
    fn remove_entry(&self, key: &CacheKey) -> io::Result<u64>;
}

/// Result of [`DeleteManager::mark_for_deletion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    Deleted { bytes_freed: u64 },
    /// Runs when the last of `users` releases the key.
    Deferred { users: usize },
}

#[derive(Debug, Default)]
struct UseRecord {
    count: usize,
    pending_delete: bool,
    removing: bool,
}

struct Inner {
    registry: Mutex<HashMap<CacheKey, UseRecord>>,
    removal_done: Condvar,
    remover: Weak<dyn EntryRemover>,
    events: EventBus,
}

/// Cloning shares the registry.
#[derive(Clone)]
pub struct DeleteManager {
    inner: Arc<Inner>,
}

impl DeleteManager {
    pub fn new(remover: Weak<dyn EntryRemover>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(HashMap::new()),
                removal_done: Condvar::new(),
                remover,
                events,
            }),
        }
    }

    /// Register a user of `key` until the returned guard drops.
    pub fn start_use(&self, key: &CacheKey) -> UseGuard {
        let mut registry = self.lock_settled(key);
        registry.entry(key.clone()).or_default().count += 1;
        drop(registry);
        UseGuard {
            manager: self.clone(),
            key: key.clone(),
        }
    }

    /// Delete `key` now if unused, otherwise once its last user releases it.
    pub fn mark_for_deletion(&self, key: &CacheKey) -> io::Result<DeletionOutcome> {
        let mut registry = self.lock_settled(key);
        if let Some(record) = registry.get_mut(key) {
            if record.count > 0 {
                record.pending_delete = true;
                let users = record.count;
                drop(registry);
                debug!(key = %key, users, "Deletion deferred while in use");
                self.emit(StoreEvent::DeletionDeferred {
                    key: key.to_string(),
                    users,
                });
                return Ok(DeletionOutcome::Deferred { users });
            }
        }
        registry.entry(key.clone()).or_default().removing = true;
        drop(registry);
        let bytes_freed = self.remove(key)?;
        self.emit_deleted(key, bytes_freed);
        Ok(DeletionOutcome::Deleted { bytes_freed })
    }

    /// Keys with at least one active user.
    pub fn active_keys(&self) -> HashSet<CacheKey> {
        self.inner
            .registry
            .lock()
            .iter()
            .filter(|(_, record)| record.count > 0)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn use_count(&self, key: &CacheKey) -> usize {
        self.inner
            .registry
            .lock()
            .get(key)
            .map_or(0, |record| record.count)
    }

    pub fn is_pending_delete(&self, key: &CacheKey) -> bool {
        self.inner
            .registry
            .lock()
            .get(key)
            .is_some_and(|record| record.pending_delete)
    }

    fn end_use(&self, key: &CacheKey) {
        let mut registry = self.inner.registry.lock();
        let Some(record) = registry.get_mut(key) else {
            warn!(key = %key, "Use released for a key that was never started");
            return;
        };
        record.count = record.count.saturating_sub(1);
        if record.count > 0 {
            return;
        }
        if !record.pending_delete {
            registry.remove(key);
            return;
        }
        record.removing = true;
        drop(registry);
        match self.remove(key) {
            Ok(bytes_freed) => {
                debug!(key = %key, bytes_freed, "Deferred deletion completed");
                self.emit_deleted(key, bytes_freed);
            }
            Err(e) => {
                // Keep the record pending so a later release or delete retries.
                warn!(key = %key, error = %e, "Deferred deletion failed");
            }
        }
    }

    /// Registry lock, once no removal of `key` is in flight.
    fn lock_settled(&self, key: &CacheKey) -> MutexGuard<'_, HashMap<CacheKey, UseRecord>> {
        let mut registry = self.inner.registry.lock();
        while registry.get(key).is_some_and(|record| record.removing) {
            self.inner.removal_done.wait(&mut registry);
        }
        registry
    }

    /// Run the remover for a key marked `removing`, without the registry
    /// lock, then settle its record.
    fn remove(&self, key: &CacheKey) -> io::Result<u64> {
        let result = match self.inner.remover.upgrade() {
            Some(remover) => remover.remove_entry(key),
            None => Ok(0),
        };
        let mut registry = self.inner.registry.lock();
        let keep = match registry.get_mut(key) {
            Some(record) if result.is_err() => {
                record.removing = false;
                record.pending_delete
            }
            _ => false,
        };
        if !keep {
            registry.remove(key);
        }
        drop(registry);
        self.inner.removal_done.notify_all();
        result
    }

    fn emit_deleted(&self, key: &CacheKey, bytes_freed: u64) {
        self.emit(StoreEvent::EntryDeleted {
            key: key.to_string(),
            bytes_freed,
        });
    }

    fn emit(&self, event: StoreEvent) {
        self.inner.events.emit(CacheEvent::Store(event)).ok();
    }
}

impl std::fmt::Debug for DeleteManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeleteManager")
            .field("tracked_keys", &self.inner.registry.lock().len())
            .finish()
    }
}

/// One active use of a key. Dropping it ends the use.
#[must_use = "the use ends as soon as the guard is dropped"]
pub struct UseGuard {
    manager: DeleteManager,
    key: CacheKey,
}

impl UseGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// End the use now.
    pub fn release(self) {}
}

impl Drop for UseGuard {
    fn drop(&mut self) {
        self.manager.end_use(&self.key);
    }
}

impl std::fmt::Debug for UseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UseGuard").field("key", &self.key).finish()
    }
}
