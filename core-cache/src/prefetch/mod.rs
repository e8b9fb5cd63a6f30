//! Background prefetching and prefetch hit tracking.

pub mod hit_recorder;
pub mod scheduler;

pub use hit_recorder::{PrefetchHit, PrefetchHitRecorder};
pub use scheduler::{
    EnqueueOutcome, PrefetchIntent, PrefetchScheduler, PrefetchState, DEFAULT_GROUP,
    PREFETCH_PRIORITY,
};
