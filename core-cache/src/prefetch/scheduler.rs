//! # Prefetch Scheduler
//!
//! FIFO queue of prefetch intents executed one at a time, each as a
//! [`RangeFetchTask`] for a prefix of the resource.
//!
//! - At most one intent runs at a time.
//! - A key is never queued twice; asking for more of a queued key enlarges
//!   the queued intent, asking for more of a running key queues a follow-up.
//! - While the network is metered and metered prefetch is off, nothing new
//!   starts. The gate is re-evaluated on every enqueue and network change.

use crate::fetch::{FetchContext, FetchOutcome, RangeFetchTask, RequestRange};
use crate::key::CacheKey;
use crate::prefetch::hit_recorder::PrefetchHitRecorder;
use bridge_traits::network::NetworkMonitor;
use core_runtime::events::{CacheEvent, PrefetchEvent};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Group used when the caller names none.
pub const DEFAULT_GROUP: &str = "default";

/// Network priority of prefetch requests; playback uses 1.0.
pub const PREFETCH_PRIORITY: f32 = 0.1;

const RECENT_STATES: usize = 128;

/// A request to cache the first `size` bytes of a resource ahead of playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchIntent {
    pub key: CacheKey,
    pub url: String,
    /// `None` prefetches the whole resource.
    pub size: Option<u64>,
    pub group: String,
}

impl PrefetchIntent {
    pub fn new(key: CacheKey, url: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            key,
            url: url.into(),
            size,
            group: DEFAULT_GROUP.to_string(),
        }
    }

    /// An empty name means the default group.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group_name(&group.into()).to_string();
        self
    }
}

fn group_name(group: &str) -> &str {
    if group.is_empty() {
        DEFAULT_GROUP
    } else {
        group
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchState {
    Queued,
    Running,
    Finished,
    Failed,
    Canceled,
}

/// What [`PrefetchScheduler::enqueue`] did with an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The key was already queued; its size was raised to the new one.
    Enlarged,
    /// The key is running with a smaller size; a follow-up was queued.
    FollowUp,
    /// Nothing to do: already queued or running with at least this size.
    Duplicate,
    /// The scheduler has shut down.
    Rejected,
}

/// `true` if `new` asks for more than `current`. `None` is the whole resource.
fn size_exceeds(new: Option<u64>, current: Option<u64>) -> bool {
    match (new, current) {
        (None, Some(_)) => true,
        (Some(new), Some(current)) => new > current,
        _ => false,
    }
}

struct RunningIntent {
    intent: PrefetchIntent,
    cancel: CancellationToken,
    /// Set by `clear`: end without a lifecycle event.
    silent: bool,
}

struct Queue {
    pending: VecDeque<PrefetchIntent>,
    running: Option<RunningIntent>,
    recent: LruCache<CacheKey, PrefetchState>,
    gated_reported: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    wake: Notify,
    ctx: FetchContext,
    network: Arc<dyn NetworkMonitor>,
    hits: Arc<PrefetchHitRecorder>,
    shutdown: CancellationToken,
}

pub struct PrefetchScheduler {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PrefetchScheduler {
    /// Start the worker and network watcher on the current runtime.
    pub fn start(
        ctx: FetchContext,
        network: Arc<dyn NetworkMonitor>,
        hits: Arc<PrefetchHitRecorder>,
    ) -> Self {
        let capacity = NonZeroUsize::new(RECENT_STATES).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                running: None,
                recent: LruCache::new(capacity),
                gated_reported: false,
            }),
            wake: Notify::new(),
            ctx,
            network,
            hits,
            shutdown: CancellationToken::new(),
        });
        let worker = tokio::spawn(Arc::clone(&inner).run_worker());
        let watcher = tokio::spawn(Arc::clone(&inner).watch_network());
        Self {
            inner,
            tasks: Mutex::new(vec![worker, watcher]),
        }
    }

    #[instrument(skip(self, intent), fields(key = %intent.key, group = %intent.group, size = ?intent.size))]
    pub fn enqueue(&self, intent: PrefetchIntent) -> EnqueueOutcome {
        if self.inner.shutdown.is_cancelled() {
            return EnqueueOutcome::Rejected;
        }
        let outcome = {
            let mut queue = self.inner.queue.lock();
            if let Some(pos) = queue.pending.iter().position(|i| i.key == intent.key) {
                let existing = &mut queue.pending[pos];
                if size_exceeds(intent.size, existing.size) {
                    existing.size = intent.size;
                    EnqueueOutcome::Enlarged
                } else {
                    EnqueueOutcome::Duplicate
                }
            } else {
                let running_size = queue
                    .running
                    .as_ref()
                    .filter(|r| r.intent.key == intent.key)
                    .map(|r| r.intent.size);
                let outcome = match running_size {
                    Some(size) if !size_exceeds(intent.size, size) => EnqueueOutcome::Duplicate,
                    Some(_) => EnqueueOutcome::FollowUp,
                    None => EnqueueOutcome::Queued,
                };
                if outcome != EnqueueOutcome::Duplicate {
                    if outcome == EnqueueOutcome::Queued {
                        queue.recent.put(intent.key.clone(), PrefetchState::Queued);
                    }
                    queue.pending.push_back(intent.clone());
                }
                outcome
            }
        };
        debug!(?outcome, "Prefetch enqueue");

        if matches!(outcome, EnqueueOutcome::Queued | EnqueueOutcome::FollowUp) {
            self.inner.emit(PrefetchEvent::Queued {
                key: intent.key.to_string(),
                group: intent.group,
                size: intent.size,
            });
        }
        self.inner.wake.notify_one();
        outcome
    }

    /// Cancel the queued or running intent for `key`.
    pub fn cancel(&self, key: &CacheKey) -> usize {
        self.inner.cancel_where(|i| &i.key == key, false)
    }

    /// Cancel everything in `group`.
    pub fn cancel_group(&self, group: &str) -> usize {
        let group = group_name(group);
        self.inner.cancel_where(|i| i.group == group, false)
    }

    pub fn cancel_all(&self) -> usize {
        self.inner.cancel_where(|_| true, false)
    }

    /// Drop every queued intent and abort the running one, without events.
    pub fn clear(&self) {
        let dropped = self.inner.cancel_where(|_| true, true);
        debug!(dropped, "Prefetch queue cleared");
    }

    pub fn state(&self, key: &CacheKey) -> Option<PrefetchState> {
        let mut queue = self.inner.queue.lock();
        if queue.running.as_ref().is_some_and(|r| &r.intent.key == key) {
            return Some(PrefetchState::Running);
        }
        if queue.pending.iter().any(|i| &i.key == key) {
            return Some(PrefetchState::Queued);
        }
        queue.recent.get(key).copied()
    }

    /// Number of queued intents, not counting the running one.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    pub fn running_key(&self) -> Option<CacheKey> {
        self.inner
            .queue
            .lock()
            .running
            .as_ref()
            .map(|r| r.intent.key.clone())
    }

    /// Re-evaluate the metered gate now.
    pub fn network_changed(&self) {
        self.inner.wake.notify_one();
    }

    /// Stop the worker, cancelling the running intent. Queued intents stay
    /// queued but never start.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Shut down and wait for the background tasks to exit.
    pub async fn join(&self) {
        self.shutdown();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.await.ok();
        }
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for PrefetchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchScheduler")
            .field("pending", &self.pending())
            .field("running", &self.running_key())
            .finish()
    }
}

impl Inner {
    fn emit(&self, event: PrefetchEvent) {
        self.ctx.store.events().emit(CacheEvent::Prefetch(event)).ok();
    }

    fn cancel_where(&self, matches: impl Fn(&PrefetchIntent) -> bool, silent: bool) -> usize {
        let (removed, running_hit) = {
            let mut queue = self.queue.lock();
            let (removed, kept): (Vec<_>, Vec<_>) =
                queue.pending.drain(..).partition(|i| matches(i));
            queue.pending = kept.into();
            for intent in &removed {
                queue.recent.put(intent.key.clone(), PrefetchState::Canceled);
            }
            let running_hit = match queue.running.as_mut() {
                Some(running) if matches(&running.intent) => {
                    running.silent |= silent;
                    running.cancel.cancel();
                    1
                }
                _ => 0,
            };
            (removed, running_hit)
        };
        if !silent {
            for intent in &removed {
                self.emit(PrefetchEvent::Canceled {
                    key: intent.key.to_string(),
                    group: intent.group.clone(),
                });
            }
        }
        removed.len() + running_hit
    }

    async fn run_worker(self: Arc<Self>) {
        while let Some((intent, cancel)) = self.next_intent().await {
            info!(key = %intent.key, size = ?intent.size, "Prefetch started");
            self.emit(PrefetchEvent::Started {
                key: intent.key.to_string(),
                group: intent.group.clone(),
            });
            let outcome = RangeFetchTask::new(self.ctx.clone(), intent.key.clone(), intent.url.clone())
                .with_cancel_token(cancel)
                .start(RequestRange::prefix(intent.size), PREFETCH_PRIORITY)
                .wait()
                .await;
            self.finish_running(&intent, outcome);
        }
        debug!("Prefetch worker stopped");
    }

    /// Wait until an intent may start and take it.
    async fn next_intent(&self) -> Option<(PrefetchIntent, CancellationToken)> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            let allowed = self.ctx.store.settings().prefetch_on_metered()
                || !self.network.is_metered().await;
            let gated = {
                let mut queue = self.queue.lock();
                if allowed {
                    queue.gated_reported = false;
                    if let Some(intent) = queue.pending.pop_front() {
                        let cancel = self.shutdown.child_token();
                        queue.recent.put(intent.key.clone(), PrefetchState::Running);
                        queue.running = Some(RunningIntent {
                            intent: intent.clone(),
                            cancel: cancel.clone(),
                            silent: false,
                        });
                        return Some((intent, cancel));
                    }
                    None
                } else if !queue.pending.is_empty() && !queue.gated_reported {
                    queue.gated_reported = true;
                    Some(queue.pending.len())
                } else {
                    None
                }
            };
            if let Some(pending) = gated {
                info!(pending, "Prefetch paused on metered network");
                self.emit(PrefetchEvent::Gated { pending });
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = self.wake.notified() => {}
            }
        }
    }

    fn finish_running(&self, intent: &PrefetchIntent, outcome: FetchOutcome) {
        let key = intent.key.to_string();
        let group = intent.group.clone();
        let (state, event) = match outcome {
            FetchOutcome::Completed { network_bytes } => {
                let cached_bytes = self.ctx.store.query_info(&intent.key).cached_length;
                self.hits.record_prefetch(&intent.key, cached_bytes);
                debug!(key, network_bytes, cached_bytes, "Prefetch finished");
                (
                    PrefetchState::Finished,
                    PrefetchEvent::Finished {
                        key,
                        group,
                        cached_bytes,
                    },
                )
            }
            FetchOutcome::Failed(error) => (
                PrefetchState::Failed,
                PrefetchEvent::Failed {
                    key,
                    group,
                    message: error.to_string(),
                },
            ),
            FetchOutcome::Canceled => (PrefetchState::Canceled, PrefetchEvent::Canceled { key, group }),
        };
        let silent = {
            let mut queue = self.queue.lock();
            let silent = queue.running.take().is_some_and(|r| r.silent);
            queue.recent.put(intent.key.clone(), state);
            silent
        };
        if !silent {
            self.emit(event);
        }
    }

    async fn watch_network(self: Arc<Self>) {
        let mut changes = match self.network.subscribe_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                debug!(error = %e, "No network change stream; gate re-checked on enqueue only");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                change = changes.next() => match change {
                    Some(info) => {
                        debug!(?info, "Network changed");
                        self.wake.notify_one();
                    }
                    None => break,
                },
            }
        }
    }
}
