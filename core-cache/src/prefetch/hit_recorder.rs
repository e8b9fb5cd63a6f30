//! Tracks finished prefetches so playback can tell whether they paid off.

use crate::key::CacheKey;
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_runtime::config::SharedSettings;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

const MAX_TRACKED_PREFETCHES: usize = 256;

/// Whether playback found a recent prefetch of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchHit {
    Hit { size: u64 },
    Miss,
}

#[derive(Debug, Clone, Copy)]
struct PrefetchRecord {
    size: u64,
    finished_at: DateTime<Utc>,
}

pub struct PrefetchHitRecorder {
    records: Mutex<LruCache<CacheKey, PrefetchRecord>>,
    clock: Arc<dyn Clock>,
    settings: SharedSettings,
}

impl PrefetchHitRecorder {
    pub fn new(clock: Arc<dyn Clock>, settings: SharedSettings) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_PREFETCHES).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: Mutex::new(LruCache::new(capacity)),
            clock,
            settings,
        }
    }

    /// Remember that `size` bytes of `key` were just prefetched.
    pub fn record_prefetch(&self, key: &CacheKey, size: u64) {
        let finished_at = self.clock.now();
        self.records
            .lock()
            .put(key.clone(), PrefetchRecord { size, finished_at });
    }

    /// Playback of `key` started. A hit consumes the record.
    pub fn on_play(&self, key: &CacheKey) -> PrefetchHit {
        let lifetime = self.settings.read(|s| s.prefetch_hit_lifetime);
        let now = self.clock.now();
        let record = self.records.lock().pop(key);
        let hit = match record {
            Some(record)
                if now
                    .signed_duration_since(record.finished_at)
                    .to_std()
                    .map_or(true, |age| age <= lifetime) =>
            {
                PrefetchHit::Hit { size: record.size }
            }
            _ => PrefetchHit::Miss,
        };
        debug!(key = %key, ?hit, "Playback prefetch check");

        if let Some(observer) = self.settings.observers().prefetch_hit_observer() {
            match hit {
                PrefetchHit::Hit { size } => observer.did_hit(key.as_str(), size),
                PrefetchHit::Miss => observer.did_miss(key.as_str()),
            }
        }
        hit
    }

    pub fn tracked(&self) -> usize {
        self.records.lock().len()
    }
}

impl std::fmt::Debug for PrefetchHitRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchHitRecorder")
            .field("tracked", &self.tracked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;
    use core_runtime::config::CacheSettings;
    use core_runtime::hooks::{Observers, PrefetchHitObserver};
    use std::time::Duration;

    #[derive(Default)]
    struct Seen {
        hits: Mutex<Vec<(String, u64)>>,
        misses: Mutex<Vec<String>>,
    }

    impl PrefetchHitObserver for Seen {
        fn did_hit(&self, key: &str, size: u64) {
            self.hits.lock().push((key.to_string(), size));
        }

        fn did_miss(&self, key: &str) {
            self.misses.lock().push(key.to_string());
        }
    }

    fn setup() -> (Arc<ManualClock>, Arc<Seen>, Arc<dyn PrefetchHitObserver>, PrefetchHitRecorder) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let seen = Arc::new(Seen::default());
        let observer: Arc<dyn PrefetchHitObserver> = seen.clone();
        let settings = SharedSettings::new(CacheSettings {
            prefetch_hit_lifetime: Duration::from_secs(60),
            observers: Observers::default().with_prefetch_hit_observer(&observer),
            ..CacheSettings::default()
        });
        let recorder = PrefetchHitRecorder::new(clock.clone(), settings);
        (clock, seen, observer, recorder)
    }

    #[test]
    fn test_hit_within_lifetime() {
        let (clock, seen, _observer, recorder) = setup();
        let key = CacheKey::new("a").unwrap();
        recorder.record_prefetch(&key, 1024);
        clock.advance(chrono::Duration::seconds(30));

        assert_eq!(recorder.on_play(&key), PrefetchHit::Hit { size: 1024 });
        assert_eq!(*seen.hits.lock(), vec![("a".to_string(), 1024)]);
        // The record is consumed.
        assert_eq!(recorder.on_play(&key), PrefetchHit::Miss);
    }

    #[test]
    fn test_expired_prefetch_is_a_miss() {
        let (clock, seen, _observer, recorder) = setup();
        let key = CacheKey::new("a").unwrap();
        recorder.record_prefetch(&key, 1024);
        clock.advance(chrono::Duration::seconds(61));

        assert_eq!(recorder.on_play(&key), PrefetchHit::Miss);
        assert_eq!(*seen.misses.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_never_prefetched_is_a_miss() {
        let (_clock, _seen, _observer, recorder) = setup();
        assert_eq!(recorder.on_play(&CacheKey::new("b").unwrap()), PrefetchHit::Miss);
    }
}
