//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP, file system,
//! network monitor, clock) into the media cache and exposes the surface the
//! playback layer talks to: cache queries, prefetch control and play
//! sessions. Desktop apps typically enable the `desktop-shims` feature (which
//! depends on `bridge-desktop`); mobile hosts inject their own bridges through
//! [`CoreConfig`].

pub mod error;

pub use error::{CoreError, Result};

pub use core_cache::{
    CacheError, CacheInfo, CacheKey, CacheMetadataInfo, CacheStats, ClearReport, EnqueueOutcome,
    PlaySession, PrefetchState, TrimReport,
};
pub use core_runtime::config::{CacheSettings, CoreConfig};

use bridge_traits::network::NetworkMonitor;
use bridge_traits::storage::FileSystemAccess;
use core_cache::{
    CacheStore, FetchContext, PrefetchHitRecorder, PrefetchIntent, PrefetchScheduler, Trimmer,
};
use core_runtime::config::SharedSettings;
use core_runtime::events::{CacheEvent, EventBus};
use core_runtime::logging::{read_log_tail, redact_url, LoggingConfig};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Primary façade exposed to host applications.
///
/// One instance per cache directory. Must be created inside a Tokio runtime;
/// the prefetch worker and the auto-trim loop run on it until
/// [`shutdown`](CacheService::shutdown).
pub struct CacheService {
    store: Arc<CacheStore>,
    ctx: FetchContext,
    scheduler: PrefetchScheduler,
    hits: Arc<PrefetchHitRecorder>,
    trimmer: Arc<Trimmer>,
    network: Arc<dyn NetworkMonitor>,
    settings: SharedSettings,
    events: EventBus,
    log_dir: PathBuf,
    shutdown: CancellationToken,
    auto_trim: Mutex<Option<JoinHandle<()>>>,
}

impl CacheService {
    /// Open the store in `config.cache_dir` and start the background work.
    #[instrument(skip_all, fields(cache_dir = %config.cache_dir.display()))]
    pub async fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        config
            .file_system
            .create_dir_all(&config.cache_dir)
            .await
            .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;

        let store = CacheStore::open(
            &config.cache_dir,
            Arc::clone(&config.clock),
            config.settings.clone(),
            config.event_bus.clone(),
        )
        .await?;
        let ctx = FetchContext::new(
            Arc::clone(&store),
            Arc::clone(&config.http_client),
            Arc::clone(&config.file_system),
        );
        let hits = Arc::new(PrefetchHitRecorder::new(
            Arc::clone(&config.clock),
            config.settings.clone(),
        ));
        let scheduler = PrefetchScheduler::start(
            ctx.clone(),
            Arc::clone(&config.network_monitor),
            Arc::clone(&hits),
        );
        let trimmer = Arc::new(Trimmer::new(
            Arc::clone(&store),
            Arc::clone(&config.file_system),
            config.settings.clone(),
        ));

        let shutdown = CancellationToken::new();
        let auto_trim = Arc::clone(&trimmer).spawn_auto_trim(shutdown.child_token());

        let recovery = store.recovery_report();
        info!(
            entries = recovery.loaded,
            corrupted = recovery.corrupted,
            total_bytes = store.total_size(),
            "Cache service ready"
        );

        Ok(Self {
            store,
            ctx,
            scheduler,
            hits,
            trimmer,
            network: config.network_monitor.clone(),
            settings: config.settings.clone(),
            events: config.event_bus.clone(),
            log_dir: config.log_dir(),
            shutdown,
            auto_trim: Mutex::new(Some(auto_trim)),
        })
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Subscribe to store, prefetch and report events.
    pub fn subscribe_events(&self) -> Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Change settings at runtime. Takes effect for the next operation.
    pub fn update_settings(&self, f: impl FnOnce(&mut CacheSettings)) {
        self.settings.update(f);
        // The metered flag may have changed.
        self.scheduler.network_changed();
    }

    /// Cache key for `url` under the configured key mapper.
    pub fn key_for_url(&self, url: &str) -> Result<CacheKey> {
        Ok(CacheKey::for_url(url, &self.settings)?)
    }

    // ========================================================================
    // Cache queries
    // ========================================================================

    pub fn has_cache(&self, key: &CacheKey) -> bool {
        self.store.has_cache(key)
    }

    pub fn cache_info(&self, key: &CacheKey) -> CacheInfo {
        self.store.query_info(key)
    }

    pub async fn metadata(&self, key: &CacheKey) -> Result<CacheMetadataInfo> {
        Ok(self.store.metadata(key).await?)
    }

    pub fn metadata_sync(&self, key: &CacheKey) -> Result<CacheMetadataInfo> {
        Ok(self.store.metadata_sync(key)?)
    }

    /// Cached bytes across all entries.
    pub fn total_size(&self) -> u64 {
        self.store.total_size()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Delete every entry. Entries in use go when released.
    pub fn clear(&self) -> ClearReport {
        self.store.clear()
    }

    pub fn clear_keys(&self, keys: &[CacheKey]) -> ClearReport {
        self.store.clear_keys(keys)
    }

    pub fn trim_to_quota(&self) -> TrimReport {
        self.trimmer.trim_to_quota()
    }

    pub async fn has_enough_free_disk_size(&self) -> Result<bool> {
        Ok(self.trimmer.has_enough_free_disk_size().await?)
    }

    /// Whether `media_duration` of playback can run without stalling at
    /// `network_speed_kbps` (KiB/s).
    pub fn has_enough_cache_for(
        &self,
        key: &CacheKey,
        media_duration: Duration,
        network_speed_kbps: f64,
    ) -> bool {
        self.trimmer
            .has_enough_cache_for(key, media_duration, network_speed_kbps)
    }

    pub async fn free_file_system_size(&self) -> Result<u64> {
        Ok(self.trimmer.free_file_system_size().await?)
    }

    pub async fn free_file_system_size_mb(&self) -> Result<u64> {
        Ok(self.trimmer.free_file_system_size_mb().await?)
    }

    // ========================================================================
    // Prefetch control
    // ========================================================================

    /// Queue a prefix of `url` for background caching.
    ///
    /// `size` defaults to `default_prefetch_size` (the whole resource when
    /// unset); `group` defaults to the scheduler's default group. Refused
    /// with `InsufficientDiskSpace` when the disk is below its floor.
    #[instrument(skip(self, url), fields(url = %redact_url(url)))]
    pub async fn prefetch(
        &self,
        url: &str,
        size: Option<u64>,
        group: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        let key = self.key_for_url(url)?;
        let available = self.trimmer.free_file_system_size().await?;
        let required = self.settings.min_free_disk_bytes();
        if available < required {
            warn!(available, required, "Prefetch refused, disk almost full");
            return Err(CacheError::InsufficientDiskSpace {
                available,
                required,
            }
            .into());
        }

        let size = size.or_else(|| self.settings.read(|s| s.default_prefetch_size));
        let mut intent = PrefetchIntent::new(key, url, size);
        if let Some(group) = group {
            intent = intent.in_group(group);
        }
        Ok(self.scheduler.enqueue(intent))
    }

    pub fn cancel_prefetch(&self, key: &CacheKey) -> usize {
        self.scheduler.cancel(key)
    }

    pub fn cancel_prefetch_group(&self, group: &str) -> usize {
        self.scheduler.cancel_group(group)
    }

    pub fn cancel_all_prefetches(&self) -> usize {
        self.scheduler.cancel_all()
    }

    /// Drop the prefetch queue without lifecycle events.
    pub fn clear_prefetches(&self) {
        self.scheduler.clear();
    }

    pub fn prefetch_state(&self, key: &CacheKey) -> Option<PrefetchState> {
        self.scheduler.state(key)
    }

    pub fn pending_prefetches(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn prefetch_on_metered(&self) -> bool {
        self.settings.prefetch_on_metered()
    }

    pub fn set_prefetch_on_metered(&self, enabled: bool) {
        self.update_settings(|s| s.prefetch_on_metered = enabled);
    }

    pub async fn is_metered(&self) -> bool {
        self.network.is_metered().await
    }

    // ========================================================================
    // Playback
    // ========================================================================

    /// Start the cache side of playing `url`.
    pub fn open_session(&self, url: &str) -> Result<PlaySession> {
        Ok(PlaySession::open(self.ctx.clone(), &self.hits, url)?)
    }

    // ========================================================================
    // Logging
    // ========================================================================

    /// Logging setup matching the current settings: the rolling file log is
    /// included when `file_log_enabled` is set.
    pub fn logging_config(&self) -> LoggingConfig {
        let config = LoggingConfig::default();
        if self.settings.read(|s| s.file_log_enabled) {
            config.with_file_log(self.log_dir.clone())
        } else {
            config
        }
    }

    /// Last `max_len` bytes of the newest log file.
    pub fn log_tail(&self, max_len: usize) -> Result<String> {
        Ok(read_log_tail(&self.log_dir, max_len)?)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop the prefetch worker and the auto-trim loop and wait for them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.join().await;
        let auto_trim = self.auto_trim.lock().take();
        if let Some(task) = auto_trim {
            task.await.ok();
        }
        info!("Cache service stopped");
    }
}

impl Drop for CacheService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("store", &self.store)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Convenience bootstrapper for desktop hosts.
///
/// Uses the platform cache directory and the desktop bridges.
///
/// ```no_run
/// # async fn example() -> core_service::Result<()> {
/// use core_service::bootstrap_desktop;
///
/// let cache = bootstrap_desktop(|settings| settings.prefetch_on_metered = true).await?;
/// let key = cache.key_for_url("https://cdn.example.com/v.mp4")?;
/// println!("cached: {}", cache.has_cache(&key));
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "desktop-shims")]
pub async fn bootstrap_desktop(
    configure: impl FnOnce(&mut CacheSettings),
) -> Result<CacheService> {
    let cache_dir = bridge_desktop::TokioFileSystem::new()
        .get_cache_directory()
        .await
        .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;
    let mut settings = CacheSettings::default();
    configure(&mut settings);

    let config = CoreConfig::builder()
        .cache_dir(cache_dir)
        .settings(settings)
        .build()?;
    CacheService::new(config).await
}
