//! Rate limiting logic and state management.

mod algorithm;
mod clock;
mod config;
mod limiter;
mod metrics;
mod state;
mod storage;
pub mod validate;

pub use algorithm::{
    Algorithm, FixedWindow, LeakyBucket, RateLimitAlgorithm, SlidingWindow, TokenBucket,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RateLimitConfig, DEFAULT_CACHE_TTL_MS, DEFAULT_CLEANUP_INTERVAL_MS};
pub use limiter::{RateLimiter, DEFAULT_COST, DEFAULT_PRIORITY};
pub use metrics::{ConcurrencyMetrics, MetricsSample, RateLimitMetrics};
pub use state::{
    CacheEntry, ConcurrencyState, HistoryEntry, Limits, RateLimitResult, RateLimitState,
    HISTORY_CAPACITY,
};
pub use storage::{MemoryStorage, StorageBackend, StorageError};
