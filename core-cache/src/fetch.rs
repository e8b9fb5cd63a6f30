//! # Range Fetch Task
//!
//! Satisfies a requested byte range from cache first and the network second,
//! requesting only the gaps and writing every received chunk through the
//! store before announcing it.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start──> Running ──┬──> Completed
//!                           ├──> Failed
//!                           └──> Canceled
//! ```
//!
//! A task starts once. Terminal states are final; retrying means creating a
//! new task, which skips everything the failed one already cached.
//!
//! The task holds a use of its key for its whole life, so the entry cannot be
//! deleted underneath it.

use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::range_set::ByteRange;
use crate::report::{extra, report};
use crate::stats::DownloadMeter;
use crate::store::CacheStore;
use bridge_traits::http::{HttpClient, HttpRequest, ResponseHead, StreamingResponse};
use bridge_traits::storage::FileSystemAccess;
use bytes::BytesMut;
use core_runtime::hooks::ReportLabel;
use core_runtime::logging::redact_url;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Received bytes are buffered up to this size before hitting the store.
pub const WRITE_CHUNK_SIZE: usize = 256 * 1024;

/// Priority for bytes a player is waiting on.
pub const PLAYBACK_PRIORITY: f32 = 1.0;

/// Byte span requested from a task, `start` inclusive, `end` exclusive.
/// `end: None` runs to the end of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl RequestRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// The whole resource.
    pub fn whole() -> Self {
        Self::new(0, None)
    }

    /// The first `size` bytes, or the whole resource for `None`.
    pub fn prefix(size: Option<u64>) -> Self {
        Self::new(0, size)
    }

    /// End of the span once the resource length is known.
    fn bounded_end(&self, total: Option<u64>) -> Option<u64> {
        match (self.end, total) {
            (Some(end), Some(total)) => Some(end.min(total)),
            (end, None) => end,
            (None, total) => total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl FetchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchState::Completed | FetchState::Failed | FetchState::Canceled
        )
    }
}

/// Where announced bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    Cache,
    Network,
}

/// Progress notifications, delivered in order on the handle's channel.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// Resource length or MIME type became known.
    Response {
        total_length: Option<u64>,
        mime_type: Option<String>,
    },
    /// `range` is cached and readable from the store.
    DataAvailable { range: ByteRange, origin: DataOrigin },
    Completed,
    Failed(Arc<CacheError>),
    Canceled,
}

/// Final result of a task.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Completed { network_bytes: u64 },
    Failed(Arc<CacheError>),
    Canceled,
}

/// Everything a fetch needs, shared by all tasks of one cache.
#[derive(Clone)]
pub struct FetchContext {
    pub store: Arc<CacheStore>,
    pub http: Arc<dyn HttpClient>,
    pub file_system: Arc<dyn FileSystemAccess>,
    pub meter: Arc<DownloadMeter>,
}

impl FetchContext {
    pub fn new(
        store: Arc<CacheStore>,
        http: Arc<dyn HttpClient>,
        file_system: Arc<dyn FileSystemAccess>,
    ) -> Self {
        let meter = Arc::new(DownloadMeter::new(store.settings().clone()));
        Self {
            store,
            http,
            file_system,
            meter,
        }
    }
}

impl std::fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchContext")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// A not-yet-started fetch of one resource.
pub struct RangeFetchTask {
    ctx: FetchContext,
    key: CacheKey,
    url: String,
    cancel: CancellationToken,
}

impl RangeFetchTask {
    pub fn new(ctx: FetchContext, key: CacheKey, url: impl Into<String>) -> Self {
        Self {
            ctx,
            key,
            url: url.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel this task together with `token`.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Spawn the fetch on the current runtime.
    pub fn start(self, range: RequestRange, priority: f32) -> FetchHandle {
        let guard = self.ctx.store.delete_manager().start_use(&self.key);
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(FetchState::Idle));
        let span = tracing::debug_span!("fetch", key = %self.key, url = %redact_url(&self.url));

        let worker = Worker {
            ctx: self.ctx,
            key: self.key.clone(),
            url: self.url,
            cancel: self.cancel.clone(),
            tx,
        };
        let task_state = Arc::clone(&state);
        let join = tokio::spawn(
            async move {
                *task_state.lock() = FetchState::Running;
                let result = worker.execute(range, priority).await;
                let (state, event, outcome) = match result {
                    Ok(network_bytes) => (
                        FetchState::Completed,
                        FetchEvent::Completed,
                        FetchOutcome::Completed { network_bytes },
                    ),
                    Err(CacheError::Canceled) => {
                        (FetchState::Canceled, FetchEvent::Canceled, FetchOutcome::Canceled)
                    }
                    Err(e) => {
                        warn!(error = %e, code = e.code(), "Fetch failed");
                        let e = Arc::new(e);
                        (
                            FetchState::Failed,
                            FetchEvent::Failed(Arc::clone(&e)),
                            FetchOutcome::Failed(e),
                        )
                    }
                };
                *task_state.lock() = state;
                // Release before announcing so a deferred delete has run by
                // the time the caller sees the terminal event.
                drop(guard);
                worker.tx.send(event).ok();
                outcome
            }
            .instrument(span),
        );

        FetchHandle {
            key: self.key,
            events: rx,
            cancel: self.cancel,
            state,
            join: Some(join),
            cancel_on_drop: true,
        }
    }
}

/// Control and progress side of a started task.
///
/// Dropping the handle cancels the task unless it was
/// [`detach`](FetchHandle::detach)ed.
pub struct FetchHandle {
    key: CacheKey,
    events: mpsc::UnboundedReceiver<FetchEvent>,
    cancel: CancellationToken,
    state: Arc<Mutex<FetchState>>,
    join: Option<JoinHandle<FetchOutcome>>,
    cancel_on_drop: bool,
}

impl FetchHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> FetchState {
        *self.state.lock()
    }

    /// Stop the task. No writes happen once it observes the cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next_event(&mut self) -> Option<FetchEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<FetchEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the task to end, discarding unread events.
    pub async fn wait(mut self) -> FetchOutcome {
        let Some(join) = self.join.take() else {
            return FetchOutcome::Canceled;
        };
        match join.await {
            Ok(outcome) => outcome,
            Err(e) => FetchOutcome::Failed(Arc::new(CacheError::Internal(format!(
                "fetch task ended abnormally: {}",
                e
            )))),
        }
    }

    /// Let the task run to completion without this handle.
    pub fn detach(mut self) {
        self.cancel_on_drop = false;
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        if self.cancel_on_drop && !self.state().is_terminal() {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

struct Worker {
    ctx: FetchContext,
    key: CacheKey,
    url: String,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<FetchEvent>,
}

impl Worker {
    fn store(&self) -> &CacheStore {
        &self.ctx.store
    }

    fn emit(&self, event: FetchEvent) {
        self.tx.send(event).ok();
    }

    /// Returns the number of bytes that came from the network.
    async fn execute(&self, range: RequestRange, priority: f32) -> Result<u64> {
        if range.end.is_some_and(|end| end < range.start) {
            return Err(CacheError::InvalidRange(format!(
                "end {:?} before start {}",
                range.end, range.start
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(CacheError::Canceled);
        }

        let known = self.store().snapshot(&self.key);
        if let Some(meta) = &known {
            if meta.total_length.is_some() || meta.mime_type.is_some() {
                self.emit(FetchEvent::Response {
                    total_length: meta.total_length,
                    mime_type: meta.mime_type.clone(),
                });
            }
            let window_end = range
                .bounded_end(meta.total_length)
                .or(meta.cached_ranges.max_end())
                .unwrap_or(range.start);
            for cached in meta
                .cached_ranges
                .intersections(ByteRange::new(range.start, window_end))
            {
                self.emit(FetchEvent::DataAvailable {
                    range: cached,
                    origin: DataOrigin::Cache,
                });
            }
        }

        let mut cursor = range.start;
        let mut network_bytes = 0;
        let mut space_checked = false;
        while let Some(gap) = self.next_gap(range, cursor) {
            if !space_checked {
                self.ensure_free_space().await?;
                space_checked = true;
            }
            let (reached, fetched) = self.fetch_gap(gap, priority).await?;
            network_bytes += fetched;
            cursor = reached;
        }
        debug!(network_bytes, "Requested range fully cached");
        Ok(network_bytes)
    }

    /// First uncached span at or after `cursor`, recomputed from the store so
    /// bytes written by other tasks are skipped.
    fn next_gap(&self, range: RequestRange, cursor: u64) -> Option<RequestRange> {
        let meta = self.store().snapshot(&self.key);
        let total = meta.as_ref().and_then(|m| m.total_length);
        let cached = meta.map(|m| m.cached_ranges).unwrap_or_default();

        match range.bounded_end(total) {
            Some(end) => cached
                .gaps(ByteRange::new(cursor, end))
                .first()
                .map(|gap| RequestRange::new(gap.start, Some(gap.end))),
            None => {
                let cached_end = cached.max_end().unwrap_or(0).max(cursor);
                match cached.gaps(ByteRange::new(cursor, cached_end)).first() {
                    Some(gap) => Some(RequestRange::new(gap.start, Some(gap.end))),
                    None => Some(RequestRange::new(cached_end, None)),
                }
            }
        }
    }

    async fn ensure_free_space(&self) -> Result<()> {
        let required = self.store().settings().min_free_disk_bytes();
        if required == 0 {
            return Ok(());
        }
        let available = self
            .ctx
            .file_system
            .available_space(self.store().root())
            .await?;
        if available < required {
            warn!(available, required, "Not enough free disk space to cache");
            return Err(CacheError::InsufficientDiskSpace {
                available,
                required,
            });
        }
        Ok(())
    }

    /// Request one gap and stream it into the store. Returns the offset
    /// reached and the bytes written.
    async fn fetch_gap(&self, gap: RequestRange, priority: f32) -> Result<(u64, u64)> {
        let store = self.store();
        let request = HttpRequest::get(self.url.clone())
            .range(gap.start, gap.end)
            .priority(priority);
        let cdn = store.settings().observers().cdn_observer();
        if let Some(cdn) = &cdn {
            cdn.will_send(&request, false);
        }
        debug!(start = gap.start, end = ?gap.end, "Requesting gap");

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CacheError::Canceled),
            response = self.ctx.http.send(request.clone()) => response?,
        };
        let StreamingResponse { head, mut body } = response;

        if let Some(cdn) = &cdn {
            if head.final_url != request.url {
                let mut redirected = request.clone();
                redirected.url = head.final_url.clone();
                cdn.will_send(&redirected, true);
            }
            cdn.did_receive_response(&request, &head);
        }

        if head.status == 416
            && gap.end.is_none()
            && gap.start > 0
            && self.cached_end() == Some(gap.start)
        {
            return self.resource_ends_at(gap.start, &head).await;
        }
        if head.status != 200 && head.status != 206 {
            return Err(self.bad_response(head.status));
        }
        let body_start = head.body_offset();
        if body_start > gap.start {
            return Err(self.bad_response(head.status));
        }
        // A partial reply may stop short of the request; its last byte is
        // not the end of the resource.
        let announced_end = head
            .content_range()
            .filter(|_| head.is_partial())
            .map(|r| r.end + 1);
        if announced_end.is_some_and(|end| end <= gap.start) {
            return Err(self.bad_response(head.status));
        }

        let total = head.total_length();
        let mime_type = head.content_type().map(str::to_string);
        let before = store.snapshot(&self.key);
        let learned = match &before {
            Some(meta) => {
                (total.is_some() && meta.total_length.is_none())
                    || (mime_type.is_some() && meta.mime_type != mime_type)
            }
            None => total.is_some() || mime_type.is_some(),
        };
        if learned {
            store
                .update_info(&self.key, mime_type.as_deref(), total)
                .await?;
            let meta = store.snapshot(&self.key);
            self.emit(FetchEvent::Response {
                total_length: meta.as_ref().and_then(|m| m.total_length),
                mime_type: meta.and_then(|m| m.mime_type),
            });
        }
        let total = total.or(before.and_then(|m| m.total_length));
        let end = match (gap.bounded_end(total), announced_end) {
            (Some(end), Some(announced)) => Some(end.min(announced)),
            (end, announced) => end.or(announced),
        };

        let mut pos = body_start;
        let mut write_offset = gap.start;
        let mut buffer = BytesMut::new();
        let mut fetched = 0;
        let mut failure = None;
        loop {
            if end.is_some_and(|end| pos >= end) {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CacheError::Canceled),
                next = body.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Err(e)) => {
                    failure = Some(CacheError::from(e));
                    break;
                }
                Some(Ok(chunk)) => chunk,
            };
            self.ctx.meter.record(chunk.len() as u64);

            let chunk_start = pos;
            pos += chunk.len() as u64;
            let lo = gap.start.max(chunk_start);
            let hi = end.map_or(pos, |end| end.min(pos));
            if lo < hi {
                buffer.extend_from_slice(&chunk[(lo - chunk_start) as usize..(hi - chunk_start) as usize]);
            }
            if buffer.len() >= WRITE_CHUNK_SIZE {
                fetched += self.flush(&mut buffer, &mut write_offset, total).await?;
            }
        }
        // Bytes received before a transport failure are still valid.
        fetched += self.flush(&mut buffer, &mut write_offset, total).await?;
        if let Some(e) = failure {
            return Err(e);
        }

        match end {
            Some(end) if write_offset < end => Err(CacheError::IncompleteBody {
                expected: end - gap.start,
                received: write_offset - gap.start,
            }),
            Some(end) => Ok((end, fetched)),
            None => {
                // Whole-body reply with no advertised length: the body ended
                // at the end of the resource.
                info!(total_length = write_offset, "Resource length learned from body end");
                store.update_info(&self.key, None, Some(write_offset)).await?;
                Ok((write_offset, fetched))
            }
        }
    }

    fn cached_end(&self) -> Option<u64> {
        self.store()
            .snapshot(&self.key)
            .and_then(|meta| meta.cached_ranges.max_end())
    }

    /// The origin has nothing past `offset`, which is where the cached data
    /// ends.
    async fn resource_ends_at(&self, offset: u64, head: &ResponseHead) -> Result<(u64, u64)> {
        if head.unsatisfied_length().is_some_and(|total| total != offset) {
            return Err(self.bad_response(head.status));
        }
        info!(total_length = offset, "Resource length learned from unsatisfiable range");
        let store = self.store();
        store.update_info(&self.key, None, Some(offset)).await?;
        let meta = store.snapshot(&self.key);
        self.emit(FetchEvent::Response {
            total_length: meta.as_ref().and_then(|m| m.total_length),
            mime_type: meta.and_then(|m| m.mime_type),
        });
        Ok((offset, 0))
    }

    async fn flush(
        &self,
        buffer: &mut BytesMut,
        offset: &mut u64,
        total: Option<u64>,
    ) -> Result<u64> {
        if buffer.is_empty() {
            return Ok(0);
        }
        let data = buffer.split().freeze();
        let len = data.len() as u64;
        self.store()
            .write_range(&self.key, *offset, &data, None, total)
            .await?;
        let range = ByteRange::new(*offset, *offset + len);
        *offset += len;
        self.emit(FetchEvent::DataAvailable {
            range,
            origin: DataOrigin::Network,
        });
        Ok(len)
    }

    fn bad_response(&self, status: u16) -> CacheError {
        let url = redact_url(&self.url);
        warn!(status, url, "Unexpected response status");
        let store = self.store();
        report(
            store.settings(),
            store.events(),
            ReportLabel::ServerError,
            self.key.as_str(),
            extra!("status" => status, "url" => url),
        );
        CacheError::BadResponse {
            status,
            url: url.to_string(),
        }
    }
}
