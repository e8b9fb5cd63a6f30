//! # Play Session
//!
//! The cache side of one playback: keeps the key alive, fetches what the
//! player asks for and serves reads from the store.
//!
//! Only one fetch is active per session. A new request (a seek) cancels the
//! previous one; bytes it already cached stay cached.

use crate::delete_manager::UseGuard;
use crate::error::{CacheError, Result};
use crate::fetch::{FetchContext, FetchEvent, FetchHandle, RangeFetchTask, RequestRange};
use crate::key::CacheKey;
use crate::prefetch::{PrefetchHit, PrefetchHitRecorder};
use crate::range_set::RangeSet;
use crate::report::{extra, report};
use crate::store::FinishSummary;
use bytes::Bytes;
use core_runtime::hooks::ReportLabel;
use core_runtime::logging::redact_url;
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct PlaySession {
    ctx: FetchContext,
    key: CacheKey,
    url: String,
    active: Option<FetchHandle>,
    prefetch_hit: PrefetchHit,
    _use: UseGuard,
}

impl PlaySession {
    /// Open a session for `url` under the configured key mapper.
    pub fn open(ctx: FetchContext, hits: &PrefetchHitRecorder, url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let key = CacheKey::for_url(&url, ctx.store.settings())?;
        Self::open_with_key(ctx, hits, key, url)
    }

    #[instrument(skip(ctx, hits, url), fields(key = %key))]
    pub fn open_with_key(
        ctx: FetchContext,
        hits: &PrefetchHitRecorder,
        key: CacheKey,
        url: impl Into<String>,
    ) -> Result<Self> {
        let url = url.into();
        let store = &ctx.store;
        let guard = store.delete_manager().start_use(&key);
        let info = store.query_info(&key);

        report(
            store.settings(),
            store.events(),
            ReportLabel::CachedSizeWhenPlay,
            key.as_str(),
            extra!(
                "cached_length" => info.cached_length,
                "total_length" => info.total_length.map_or_else(|| "unknown".to_string(), |t| t.to_string()),
                "complete" => info.is_complete,
            ),
        );
        if !info.is_complete {
            report(
                store.settings(),
                store.events(),
                ReportLabel::CachePlayCdnUrl,
                key.as_str(),
                extra!("url" => redact_url(&url)),
            );
        }
        let prefetch_hit = hits.on_play(&key);
        debug!(cached = info.cached_length, ?prefetch_hit, "Play session opened");

        Ok(Self {
            ctx,
            key,
            url,
            active: None,
            prefetch_hit,
            _use: guard,
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a recent prefetch covered this key when the session opened.
    pub fn prefetch_hit(&self) -> PrefetchHit {
        self.prefetch_hit
    }

    /// Fetch `range`, replacing any active fetch. Only uncached bytes go to
    /// the network.
    pub fn request(&mut self, range: RequestRange, priority: f32) -> &mut FetchHandle {
        if let Some(previous) = self.active.take() {
            previous.cancel();
        }
        let handle = RangeFetchTask::new(self.ctx.clone(), self.key.clone(), self.url.clone())
            .start(range, priority);
        self.active.insert(handle)
    }

    pub fn active(&self) -> Option<&FetchHandle> {
        self.active.as_ref()
    }

    /// Next event of the active fetch, `None` when there is none.
    pub async fn next_event(&mut self) -> Option<FetchEvent> {
        match self.active.as_mut() {
            Some(handle) => handle.next_event().await,
            None => None,
        }
    }

    /// Read cached bytes; fails with `NotFound` if any are missing.
    pub async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        self.ctx.store.read_range(&self.key, offset, length).await
    }

    pub fn read_sync(&self, offset: u64, length: u64) -> Result<Bytes> {
        self.ctx.store.read_range_sync(&self.key, offset, length)
    }

    /// Read once the active fetch has cached the bytes.
    pub async fn read_when_available(&mut self, offset: u64, length: u64) -> Result<Bytes> {
        loop {
            match self.read(offset, length).await {
                Err(CacheError::NotFound { .. }) => {}
                other => return other,
            }
            let Some(handle) = self.active.as_mut() else {
                return self.read(offset, length).await;
            };
            match handle.next_event().await {
                Some(FetchEvent::Failed(error)) => {
                    return Err(Arc::try_unwrap(error)
                        .unwrap_or_else(|shared| CacheError::Internal(shared.to_string())));
                }
                Some(FetchEvent::Canceled) => return Err(CacheError::Canceled),
                Some(FetchEvent::Completed) | None => return self.read(offset, length).await,
                Some(_) => {}
            }
        }
    }

    pub fn cached_ranges(&self) -> RangeSet {
        self.ctx.store.cached_ranges(&self.key)
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.cancel();
        }
    }

    /// End playback: stop fetching and persist the entry's bookkeeping.
    pub async fn finish(mut self) -> Result<FinishSummary> {
        self.cancel();
        self.ctx.store.finish(&self.key, Some(&self.url)).await
    }
}

impl std::fmt::Debug for PlaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaySession")
            .field("key", &self.key)
            .field("url", &redact_url(&self.url))
            .field("active", &self.active)
            .finish()
    }
}
