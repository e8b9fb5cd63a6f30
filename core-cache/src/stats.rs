//! Cache statistics and download activity sampling

use core_runtime::config::SharedSettings;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Statistics about the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of known entries, including partial ones
    pub entries: usize,

    /// Entries with every byte cached
    pub complete_entries: usize,

    /// Entries with at least one active user
    pub in_use: usize,

    /// Sum of cached bytes
    pub total_bytes: u64,

    /// Configured cost limit
    pub cost_limit_bytes: u64,

    /// Timestamp when stats were calculated
    pub calculated_at: i64,
}

impl CacheStats {
    /// Calculate cache usage as a percentage of the cost limit.
    pub fn usage_percentage(&self) -> f64 {
        if self.cost_limit_bytes == 0 {
            return 0.0;
        }

        (self.total_bytes as f64 / self.cost_limit_bytes as f64) * 100.0
    }

    /// Returns true if the cache is near capacity (>90%).
    pub fn is_near_capacity(&self) -> bool {
        self.usage_percentage() > 90.0
    }

    pub fn is_over_quota(&self) -> bool {
        self.total_bytes > self.cost_limit_bytes
    }

    /// Bytes a trim would have to free.
    pub fn space_needed(&self) -> u64 {
        self.total_bytes.saturating_sub(self.cost_limit_bytes)
    }

    /// Returns average bytes per entry.
    pub fn average_entry_size(&self) -> u64 {
        if self.entries == 0 {
            0
        } else {
            self.total_bytes / self.entries as u64
        }
    }
}

/// Aggregates bytes received by all fetch tasks and hands them to the
/// download-activity observer once per report interval.
pub struct DownloadMeter {
    settings: SharedSettings,
    window: Mutex<Window>,
}

struct Window {
    started: Instant,
    bytes: u64,
}

impl DownloadMeter {
    pub fn new(settings: SharedSettings) -> Self {
        Self {
            settings,
            window: Mutex::new(Window {
                started: Instant::now(),
                bytes: 0,
            }),
        }
    }

    /// Count `bytes` and report if the interval has elapsed.
    pub fn record(&self, bytes: u64) {
        let interval = self.settings.read(|s| s.download_report_interval);
        let due = {
            let mut window = self.window.lock();
            window.bytes += bytes;
            let elapsed = window.started.elapsed();
            if elapsed >= interval {
                let sample = (window.bytes, elapsed);
                window.bytes = 0;
                window.started = Instant::now();
                Some(sample)
            } else {
                None
            }
        };
        if let Some((bytes, elapsed)) = due {
            self.emit(bytes, elapsed);
        }
    }

    /// Report whatever is pending regardless of the interval.
    pub fn flush(&self) {
        let (bytes, elapsed) = {
            let mut window = self.window.lock();
            let sample = (window.bytes, window.started.elapsed());
            window.bytes = 0;
            window.started = Instant::now();
            sample
        };
        if bytes > 0 {
            self.emit(bytes, elapsed);
        }
    }

    fn emit(&self, bytes: u64, elapsed: Duration) {
        if let Some(observer) = self.settings.observers().download_observer() {
            observer.did_download(bytes, elapsed);
        }
    }
}

impl std::fmt::Debug for DownloadMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadMeter")
            .field("pending_bytes", &self.window.lock().bytes)
            .finish()
    }
}

/// Format bytes as human-readable string (e.g., "1.5 MB").
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
