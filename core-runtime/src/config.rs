//! # Core Configuration Module
//!
//! Configuration for the media cache.
//!
//! ## Overview
//!
//! [`CoreConfig`] is built once at startup with [`CoreConfigBuilder`]. It holds
//! the host bridges the cache talks to and a [`SharedSettings`] handle with the
//! tunables that may change while the process runs (quota, trim interval,
//! metered-network policy, key mapping, observers).
//!
//! ## Bridges (with platform defaults)
//!
//! - `HttpClient` - Range requests (desktop default: reqwest)
//! - `FileSystemAccess` - Free space queries (desktop default: tokio fs + fs2)
//! - `NetworkMonitor` - Metered network detection (desktop default: TCP probe)
//! - `Clock` - Always defaults to the system clock
//!
//! When the `desktop-shims` feature is enabled, desktop defaults are injected
//! for any bridge left unset. Otherwise a missing bridge fails the build with
//! [`Error::CapabilityMissing`].
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .cache_dir("/path/to/media-cache")
//!     .cost_limit_mb(800)
//!     .auto_trim_interval(Duration::from_secs(120))
//!     .build()?;
//!
//! // Later, from any thread:
//! config.settings.update(|s| s.prefetch_on_metered = true);
//! ```

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::hooks::{
    CdnRequestObserver, DownloadActivityObserver, Observers, PrefetchHitObserver, ReportExtra,
    ReportLabel,
};
use bridge_traits::{Clock, FileSystemAccess, HttpClient, NetworkMonitor, SystemClock};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Default quota: 500 MiB.
pub const DEFAULT_COST_LIMIT_BYTES: u64 = 500 * MIB;

/// Default auto-trim period: 5 minutes.
pub const DEFAULT_AUTO_TRIM_INTERVAL: Duration = Duration::from_secs(300);

/// Writes are refused below 200 MiB of free disk.
pub const DEFAULT_MIN_FREE_DISK_BYTES: u64 = 200 * MIB;

pub const DEFAULT_DOWNLOAD_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// A prefetch counts as a hit if playback starts within 10 minutes.
pub const DEFAULT_PREFETCH_HIT_LIFETIME: Duration = Duration::from_secs(600);

/// Maps a source URL to the cache key used to name its files.
pub type KeyMapper = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Default URL-to-key mapping: lowercase hex SHA-256 of the full URL.
pub fn default_cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Tunables that may change while the cache is running.
#[derive(Clone)]
pub struct CacheSettings {
    /// Quota enforced by the trimmer
    pub cost_limit_bytes: u64,

    /// Period of the background trim. `Duration::ZERO` disables it.
    pub auto_trim_interval: Duration,

    /// Free disk space required before new bytes are written
    pub min_free_disk_bytes: u64,

    /// Mirror logs into a rolling file inside the cache directory
    pub file_log_enabled: bool,

    /// Allow prefetching on metered connections
    pub prefetch_on_metered: bool,

    /// Prefetch size when the caller gives none. `None` fetches the whole resource.
    pub default_prefetch_size: Option<u64>,

    pub download_report_interval: Duration,

    pub prefetch_hit_lifetime: Duration,

    pub key_mapper: KeyMapper,

    pub observers: Observers,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cost_limit_bytes: DEFAULT_COST_LIMIT_BYTES,
            auto_trim_interval: DEFAULT_AUTO_TRIM_INTERVAL,
            min_free_disk_bytes: DEFAULT_MIN_FREE_DISK_BYTES,
            file_log_enabled: false,
            prefetch_on_metered: false,
            default_prefetch_size: None,
            download_report_interval: DEFAULT_DOWNLOAD_REPORT_INTERVAL,
            prefetch_hit_lifetime: DEFAULT_PREFETCH_HIT_LIFETIME,
            key_mapper: Arc::new(default_cache_key),
            observers: Observers::default(),
        }
    }
}

impl std::fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSettings")
            .field("cost_limit_bytes", &self.cost_limit_bytes)
            .field("auto_trim_interval", &self.auto_trim_interval)
            .field("min_free_disk_bytes", &self.min_free_disk_bytes)
            .field("file_log_enabled", &self.file_log_enabled)
            .field("prefetch_on_metered", &self.prefetch_on_metered)
            .field("default_prefetch_size", &self.default_prefetch_size)
            .field("download_report_interval", &self.download_report_interval)
            .field("prefetch_hit_lifetime", &self.prefetch_hit_lifetime)
            .field("key_mapper", &"Fn(&str) -> String")
            .field("observers", &self.observers)
            .finish()
    }
}

impl CacheSettings {
    pub fn validate(&self) -> Result<()> {
        if self.cost_limit_bytes == 0 {
            return Err(Error::Config(
                "Cost limit must be greater than 0 bytes".to_string(),
            ));
        }

        if self.download_report_interval.is_zero() {
            return Err(Error::Config(
                "Download report interval must be greater than zero".to_string(),
            ));
        }

        if self.prefetch_hit_lifetime.is_zero() {
            return Err(Error::Config(
                "Prefetch hit lifetime must be greater than zero".to_string(),
            ));
        }

        if self.default_prefetch_size == Some(0) {
            return Err(Error::Config(
                "Default prefetch size must be greater than 0 bytes or unset".to_string(),
            ));
        }

        Ok(())
    }
}

/// Process-wide handle to [`CacheSettings`].
///
/// Readers take a cheap snapshot or a single field; writers go through
/// [`update`](SharedSettings::update). The lock is never held across an
/// `.await`.
#[derive(Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<CacheSettings>>,
}

impl SharedSettings {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> CacheSettings {
        self.inner.read().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&CacheSettings) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn update(&self, f: impl FnOnce(&mut CacheSettings)) {
        f(&mut self.inner.write());
    }

    pub fn cost_limit_bytes(&self) -> u64 {
        self.inner.read().cost_limit_bytes
    }

    pub fn min_free_disk_bytes(&self) -> u64 {
        self.inner.read().min_free_disk_bytes
    }

    pub fn prefetch_on_metered(&self) -> bool {
        self.inner.read().prefetch_on_metered
    }

    pub fn observers(&self) -> Observers {
        self.inner.read().observers.clone()
    }

    /// Map a source URL to its cache key.
    pub fn cache_key_for(&self, url: &str) -> String {
        let mapper = Arc::clone(&self.inner.read().key_mapper);
        mapper(url)
    }

    pub fn report(&self, label: ReportLabel, resource_id: &str, extra: &ReportExtra) {
        self.observers().report(label, resource_id, extra);
    }
}

impl std::fmt::Debug for SharedSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.read().fmt(f)
    }
}

/// Core configuration for the media cache.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Directory holding metadata, data files and (optionally) logs
    pub cache_dir: PathBuf,

    pub http_client: Arc<dyn HttpClient>,

    pub file_system: Arc<dyn FileSystemAccess>,

    pub network_monitor: Arc<dyn NetworkMonitor>,

    pub clock: Arc<dyn Clock>,

    pub settings: SharedSettings,

    pub event_bus: EventBus,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("cache_dir", &self.cache_dir)
            .field("http_client", &"HttpClient { ... }")
            .field("file_system", &"FileSystemAccess { ... }")
            .field("network_monitor", &"NetworkMonitor { ... }")
            .field("clock", &"Clock { ... }")
            .field("settings", &self.settings)
            .field("event_bus", &self.event_bus)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Cache directory is not empty
    /// - Settings are within range
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::Config("Cache directory cannot be empty".to_string()));
        }

        self.settings.read(CacheSettings::validate)
    }

    /// Location of the rolling log file when `file_log_enabled` is set.
    pub fn log_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn capability_missing(capability: &str, purpose: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: format!(
            "{} implementation is required {}. \
             Desktop: enable the 'desktop-shims' feature to use the default adapter. \
             Mobile: inject the platform-native adapter.",
            capability, purpose
        ),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::new()
        .map_err(|e| Error::Internal(format!("Failed to create default HttpClient: {}", e)))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(capability_missing("HttpClient", "to fetch uncached ranges"))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(cache_dir: &Path) -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    Ok(Arc::new(TokioFileSystem::with_cache_directory(
        cache_dir.to_path_buf(),
    )))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(_cache_dir: &Path) -> Result<Arc<dyn FileSystemAccess>> {
    Err(capability_missing(
        "FileSystemAccess",
        "to check free disk space",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_network_monitor() -> Result<Arc<dyn NetworkMonitor>> {
    use bridge_desktop::DesktopNetworkMonitor;

    Ok(Arc::new(DesktopNetworkMonitor::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_network_monitor() -> Result<Arc<dyn NetworkMonitor>> {
    Err(capability_missing(
        "NetworkMonitor",
        "to gate prefetching on metered networks",
    ))
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    cache_dir: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    event_bus: Option<EventBus>,
    settings: CacheSettings,
}

impl CoreConfigBuilder {
    /// Sets the cache directory (required).
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder()
    ///     .cache_dir("/path/to/cache");
    /// ```
    pub fn cache_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) will be used when
    /// the `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Replaces the system clock, mostly for tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shares an existing event bus instead of creating one.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Replaces every tunable at once.
    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the quota in bytes.
    ///
    /// Default: 500 MiB
    pub fn cost_limit_bytes(mut self, bytes: u64) -> Self {
        self.settings.cost_limit_bytes = bytes;
        self
    }

    /// Sets the quota in megabytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder()
    ///     .cost_limit_mb(2048); // 2 GiB
    /// ```
    pub fn cost_limit_mb(self, mb: u64) -> Self {
        self.cost_limit_bytes(mb.saturating_mul(MIB))
    }

    /// Sets the background trim period. `Duration::ZERO` disables it.
    pub fn auto_trim_interval(mut self, interval: Duration) -> Self {
        self.settings.auto_trim_interval = interval;
        self
    }

    pub fn min_free_disk_bytes(mut self, bytes: u64) -> Self {
        self.settings.min_free_disk_bytes = bytes;
        self
    }

    pub fn file_log_enabled(mut self, enabled: bool) -> Self {
        self.settings.file_log_enabled = enabled;
        self
    }

    pub fn prefetch_on_metered(mut self, enabled: bool) -> Self {
        self.settings.prefetch_on_metered = enabled;
        self
    }

    pub fn default_prefetch_size(mut self, size: Option<u64>) -> Self {
        self.settings.default_prefetch_size = size;
        self
    }

    pub fn download_report_interval(mut self, interval: Duration) -> Self {
        self.settings.download_report_interval = interval;
        self
    }

    pub fn prefetch_hit_lifetime(mut self, lifetime: Duration) -> Self {
        self.settings.prefetch_hit_lifetime = lifetime;
        self
    }

    /// Sets the URL-to-key mapping.
    ///
    /// Several URLs (e.g. CDN mirrors, signed variants) may map to the same
    /// key to share cached bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder().key_mapper(|url: &str| {
    ///     url.split('?').next().unwrap_or(url).to_string()
    /// });
    /// ```
    pub fn key_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.settings.key_mapper = Arc::new(mapper);
        self
    }

    pub fn reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(ReportLabel, &str, &ReportExtra) + Send + Sync + 'static,
    {
        self.settings.observers = self.settings.observers.with_reporter(reporter);
        self
    }

    /// Registers a download observer. Only a weak handle is kept.
    pub fn download_observer(mut self, observer: &Arc<dyn DownloadActivityObserver>) -> Self {
        self.settings.observers = self.settings.observers.with_download_observer(observer);
        self
    }

    /// Registers a CDN observer. Only a weak handle is kept.
    pub fn cdn_observer(mut self, observer: &Arc<dyn CdnRequestObserver>) -> Self {
        self.settings.observers = self.settings.observers.with_cdn_observer(observer);
        self
    }

    /// Registers a prefetch hit observer. Only a weak handle is kept.
    pub fn prefetch_hit_observer(mut self, observer: &Arc<dyn PrefetchHitObserver>) -> Self {
        self.settings.observers = self.settings.observers.with_prefetch_hit_observer(observer);
        self
    }

    /// Builds the final configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The cache directory is not set
    /// - A bridge is missing and no desktop default is available
    /// - A setting is out of range
    pub fn build(self) -> Result<CoreConfig> {
        let cache_dir = self.cache_dir.ok_or_else(|| {
            Error::Config("Cache directory is required. Use .cache_dir() to set it.".to_string())
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system(&cache_dir)?,
        };

        let network_monitor = match self.network_monitor {
            Some(monitor) => monitor,
            None => provide_default_network_monitor()?,
        };

        let config = CoreConfig {
            cache_dir,
            http_client,
            file_system,
            network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            settings: SharedSettings::new(self.settings),
            event_bus: self.event_bus.unwrap_or_default(),
        };

        config.validate()?;

        Ok(config)
    }
}
