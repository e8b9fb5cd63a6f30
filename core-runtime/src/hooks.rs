//! # Observer Hooks
//!
//! Callbacks the host registers to watch the cache work. The cache never keeps
//! an observer alive: observers are held through [`Weak`] handles and silently
//! skipped once the host drops them. The reporter is a plain closure since it
//! carries no state of its own.

use bridge_traits::http::{HttpRequest, ResponseHead};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Operational event labels passed to the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLabel {
    /// Bytes already on disk when playback of a key started
    CachedSizeWhenPlay,
    /// Data file missing or shorter than its metadata claims
    CacheDataCorrupted,
    /// Non-2xx response to a range request
    ServerError,
    /// Playback served from a CDN URL, with the URL as payload
    CachePlayCdnUrl,
    WriteFileFail,
    ReadFileFail,
    /// Metadata record failed to parse or violated range invariants
    MetaDataCorrupted,
}

impl ReportLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportLabel::CachedSizeWhenPlay => "cached_size_when_play",
            ReportLabel::CacheDataCorrupted => "cache_data_corrupted",
            ReportLabel::ServerError => "server_error",
            ReportLabel::CachePlayCdnUrl => "cache_play_cdn_url",
            ReportLabel::WriteFileFail => "write_file_fail",
            ReportLabel::ReadFileFail => "read_file_fail",
            ReportLabel::MetaDataCorrupted => "meta_data_corrupted",
        }
    }
}

impl fmt::Display for ReportLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form report payload.
pub type ReportExtra = BTreeMap<String, String>;

/// `(label, resource_id, extra)`
pub type Reporter = Arc<dyn Fn(ReportLabel, &str, &ReportExtra) + Send + Sync>;

/// Aggregated download throughput, sampled every
/// `CacheSettings::download_report_interval`.
pub trait DownloadActivityObserver: Send + Sync {
    fn did_download(&self, bytes: u64, interval: Duration);
}

/// Sees every range request the cache sends to the network.
pub trait CdnRequestObserver: Send + Sync {
    /// Called before a request goes out, and again with `is_redirect = true`
    /// when the response came from a different URL.
    fn will_send(&self, request: &HttpRequest, is_redirect: bool);

    fn did_receive_response(&self, request: &HttpRequest, head: &ResponseHead);
}

/// Learns whether prefetched data was actually played.
pub trait PrefetchHitObserver: Send + Sync {
    /// Playback started for a key that finished prefetching `size` bytes
    /// within the hit lifetime.
    fn did_hit(&self, key: &str, size: u64);

    /// Playback started for a key with no recent prefetch.
    fn did_miss(&self, key: &str);
}

/// Registered observers. Cloning is cheap.
#[derive(Clone, Default)]
pub struct Observers {
    reporter: Option<Reporter>,
    download: Option<Weak<dyn DownloadActivityObserver>>,
    cdn: Option<Weak<dyn CdnRequestObserver>>,
    prefetch_hit: Option<Weak<dyn PrefetchHitObserver>>,
}

impl Observers {
    pub fn with_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(ReportLabel, &str, &ReportExtra) + Send + Sync + 'static,
    {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    pub fn with_download_observer(mut self, observer: &Arc<dyn DownloadActivityObserver>) -> Self {
        self.download = Some(Arc::downgrade(observer));
        self
    }

    pub fn with_cdn_observer(mut self, observer: &Arc<dyn CdnRequestObserver>) -> Self {
        self.cdn = Some(Arc::downgrade(observer));
        self
    }

    pub fn with_prefetch_hit_observer(mut self, observer: &Arc<dyn PrefetchHitObserver>) -> Self {
        self.prefetch_hit = Some(Arc::downgrade(observer));
        self
    }

    pub fn report(&self, label: ReportLabel, resource_id: &str, extra: &ReportExtra) {
        if let Some(reporter) = &self.reporter {
            reporter(label, resource_id, extra);
        }
    }

    pub fn download_observer(&self) -> Option<Arc<dyn DownloadActivityObserver>> {
        self.download.as_ref().and_then(Weak::upgrade)
    }

    pub fn cdn_observer(&self) -> Option<Arc<dyn CdnRequestObserver>> {
        self.cdn.as_ref().and_then(Weak::upgrade)
    }

    pub fn prefetch_hit_observer(&self) -> Option<Arc<dyn PrefetchHitObserver>> {
        self.prefetch_hit.as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("reporter", &self.reporter.is_some())
            .field("download", &self.download_observer().is_some())
            .field("cdn", &self.cdn_observer().is_some())
            .field("prefetch_hit", &self.prefetch_hit_observer().is_some())
            .finish()
    }
}
