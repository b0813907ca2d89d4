//! Limiter configuration.

use serde::{Deserialize, Serialize};

use super::algorithm::Algorithm;
use super::state::{Limits, HISTORY_CAPACITY};
use super::validate;
use crate::error::{Result, TollgateError};

/// Default lifetime of a memoized decision.
pub const DEFAULT_CACHE_TTL_MS: u64 = 1_000;
/// Default interval between cache/metrics sweeps (five minutes).
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 300_000;

/// Construction-time configuration for a [`super::RateLimiter`].
///
/// The optional distributed storage backend is passed separately to
/// [`super::RateLimiter::with_storage`] since it is not plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub max_requests: u64,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// Maximum capacity; defaults to `max_requests`
    #[serde(default)]
    pub burst: Option<f64>,

    /// Accounting rule
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Continuous refill in tokens per second; defaults to the window rate
    #[serde(default)]
    pub restore_rate: Option<f64>,

    /// Per-key ceiling on in-flight checks; unbounded when absent
    #[serde(default)]
    pub concurrency: Option<u32>,

    /// Prepended to every key as `prefix:key`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How long a decision is reused; `0` disables the cache
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// How often expired cache entries and idle metrics are swept
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_cache_ttl_ms() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

fn default_cleanup_interval_ms() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_MS
}

impl RateLimitConfig {
    /// A token-bucket configuration with every optional field at its default.
    pub fn new(max_requests: u64, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            burst: None,
            algorithm: Algorithm::default(),
            restore_rate: None,
            concurrency: None,
            key_prefix: default_key_prefix(),
            cache_ttl_ms: default_cache_ttl_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn with_restore_rate(mut self, restore_rate: f64) -> Self {
        self.restore_rate = Some(restore_rate);
        self
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_cache_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = ttl_ms;
        self
    }

    /// Validate every field and resolve defaults.
    pub fn resolve(&self) -> Result<Limits> {
        validate::validate_max_requests(self.max_requests)?;
        validate::validate_window_ms(self.window_ms)?;
        validate::validate_key_prefix(&self.key_prefix)?;

        // the sliding window counts admissions in the bounded history
        if self.algorithm == Algorithm::SlidingWindow
            && self.max_requests > HISTORY_CAPACITY as u64
        {
            return Err(TollgateError::invalid(
                "max_requests",
                format!(
                    "sliding-window limiters allow at most {} requests per window, got {}",
                    HISTORY_CAPACITY, self.max_requests
                ),
            ));
        }

        let burst = self.burst.unwrap_or(self.max_requests as f64);
        validate::validate_burst(burst)?;

        let restore_rate = self
            .restore_rate
            .unwrap_or(self.max_requests as f64 / (self.window_ms as f64 / 1000.0));
        validate::validate_restore_rate(restore_rate)?;

        let concurrency = match self.concurrency {
            Some(c) => {
                validate::validate_concurrency(c)?;
                c
            }
            None => u32::MAX,
        };

        Ok(Limits {
            max_requests: self.max_requests,
            window_ms: self.window_ms,
            burst,
            restore_rate,
            concurrency,
        })
    }
}
