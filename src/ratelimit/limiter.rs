//! Core rate limiter implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::algorithm::Algorithm;
use super::clock::{Clock, SystemClock};
use super::config::RateLimitConfig;
use super::metrics::{MetricsRegistry, RateLimitMetrics};
use super::state::{CacheEntry, HistoryEntry, Limits, RateLimitResult, RateLimitState};
use super::storage::{StorageBackend, StorageError};
use super::validate;
use crate::error::Result;

/// Cost charged when the caller does not specify one.
pub const DEFAULT_COST: f64 = 1.0;
/// Priority used when the caller does not specify one.
pub const DEFAULT_PRIORITY: u8 = 5;

const INITIAL_BACKOFF_MS: f64 = 100.0;
const BACKOFF_MULTIPLIER: f64 = 1.5;
const MAX_BACKOFF_MS: f64 = 5_000.0;
const MAX_JITTER_MS: u64 = 100;
/// Metrics for keys idle longer than this are dropped by the sweep.
const METRICS_RETENTION_MS: i64 = 3_600_000;

type StateCell = Arc<Mutex<RateLimitState>>;

/// A multi-algorithm rate limiter keyed by caller-supplied strings.
///
/// This struct is thread-safe and can be shared across multiple tasks. Each
/// key's state sits behind its own mutex, so refill, consume, and history
/// append are observed atomically by concurrent checks.
pub struct RateLimiter {
    config: RateLimitConfig,
    limits: Limits,
    /// Per-key state indexed by full key
    states: DashMap<String, StateCell>,
    /// Recent decisions indexed by full key
    cache: Arc<DashMap<String, CacheEntry>>,
    metrics: Arc<MetricsRegistry>,
    storage: Option<Arc<dyn StorageBackend>>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Holds one concurrency slot for a key; releases it on drop.
struct SlotGuard {
    cell: StateCell,
}

impl SlotGuard {
    /// Take a slot, or report the in-flight count if the ceiling is reached.
    fn acquire(cell: &StateCell) -> std::result::Result<(Self, u32), u32> {
        let mut state = cell.lock();
        if state.concurrency.current >= state.concurrency.max {
            return Err(state.concurrency.current);
        }
        state.concurrency.current += 1;
        Ok((Self { cell: cell.clone() }, state.concurrency.current))
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut state = self.cell.lock();
        state.concurrency.current = state.concurrency.current.saturating_sub(1);
    }
}

impl RateLimiter {
    /// Create a process-local rate limiter.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::build(config, None, Arc::new(SystemClock))
    }

    /// Create a rate limiter whose state is shared through `storage`.
    pub fn with_storage(config: RateLimitConfig, storage: Arc<dyn StorageBackend>) -> Result<Self> {
        Self::build(config, Some(storage), Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit time source.
    pub fn with_clock(
        config: RateLimitConfig,
        storage: Option<Arc<dyn StorageBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::build(config, storage, clock)
    }

    fn build(
        config: RateLimitConfig,
        storage: Option<Arc<dyn StorageBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let limits = config.resolve()?;

        info!(
            key_prefix = %config.key_prefix,
            algorithm = %config.algorithm,
            max_requests = limits.max_requests,
            window_ms = limits.window_ms,
            burst = limits.burst,
            distributed = storage.is_some(),
            "Rate limiter initialized"
        );

        let limiter = Self {
            config,
            limits,
            states: DashMap::new(),
            cache: Arc::new(DashMap::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            storage,
            clock,
            sweeper: Mutex::new(None),
        };
        limiter.spawn_sweeper();
        Ok(limiter)
    }

    /// Start the periodic cache/metrics sweep if a runtime is available.
    fn spawn_sweeper(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No tokio runtime; periodic sweep disabled");
            return;
        };

        let cache = Arc::clone(&self.cache);
        let metrics = Arc::clone(&self.metrics);
        let clock = Arc::clone(&self.clock);
        let period = Duration::from_millis(self.config.cleanup_interval_ms.max(1));

        let task = handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let now = clock.now_ms();
                let before = cache.len();
                cache.retain(|_, entry| entry.is_live(now));
                let evicted = before.saturating_sub(cache.len());
                let idle = metrics.sweep(now - METRICS_RETENTION_MS);
                trace!(evicted, idle, "Swept rate limiter caches");
            }
        });
        *self.sweeper.lock() = Some(task);
    }

    /// The configuration this limiter was built from.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Limits after defaults were applied.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    /// Seconds persisted state should outlive its last write.
    fn storage_ttl_secs(&self) -> u64 {
        let span_ms = self.limits.window_ms.max(self.limits.full_refill_ms());
        span_ms.div_ceil(1000).max(1)
    }

    fn cell(&self, full_key: &str, now: i64) -> StateCell {
        if let Some(cell) = self.states.get(full_key) {
            return Arc::clone(cell.value());
        }
        Arc::clone(
            self.states
                .entry(full_key.to_string())
                .or_insert_with(|| {
                    debug!(key = %full_key, "Creating new rate limit state");
                    Arc::new(Mutex::new(RateLimitState::new(&self.limits, now)))
                })
                .value(),
        )
    }

    fn cached(&self, full_key: &str, cost: f64, now: i64) -> Option<RateLimitResult> {
        if self.config.cache_ttl_ms == 0 {
            return None;
        }
        let entry = self.cache.get(full_key)?;
        (entry.is_live(now) && entry.result.cost == cost).then_some(entry.result)
    }

    /// Read and decode the shared state for `full_key`.
    async fn fetch_remote(
        storage: &dyn StorageBackend,
        full_key: &str,
    ) -> std::result::Result<Option<RateLimitState>, StorageError> {
        match storage.get(full_key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Pull shared state into the local cell. Failures fall back to local state.
    async fn load_remote(&self, full_key: &str, cell: &StateCell) {
        let Some(storage) = &self.storage else {
            return;
        };
        match Self::fetch_remote(storage.as_ref(), full_key).await {
            Ok(Some(mut remote)) => {
                remote.clamp_tokens(self.limits.burst);
                cell.lock().absorb(remote);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %full_key, error = %e, "Shared state unavailable, using local state");
            }
        }
    }

    /// Push local state to shared storage. Failures are logged and ignored.
    async fn store_remote(&self, full_key: &str, state: &RateLimitState) {
        let Some(storage) = &self.storage else {
            return;
        };
        let written = match serde_json::to_string(state) {
            Ok(raw) => {
                storage
                    .set(full_key, raw, Some(self.storage_ttl_secs()))
                    .await
            }
            Err(e) => Err(StorageError::from(e)),
        };
        if let Err(e) = written {
            warn!(key = %full_key, error = %e, "Storage write failed, state kept locally");
        }
    }

    /// Make a single admission decision for `key`.
    ///
    /// Never blocks. Capacity outcomes are reported in the result; only
    /// malformed input is an error. A repeated check with the same cost
    /// inside `cache_ttl_ms` returns the earlier decision without consuming.
    pub async fn check_limit(&self, key: &str, cost: f64, priority: u8) -> Result<RateLimitResult> {
        self.decide(key, cost, priority, true).await
    }

    /// Like [`Self::check_limit`], but always evaluated against the state.
    ///
    /// Use this when the caller will spend `cost` regardless of a recent
    /// identical decision, e.g. before settling the real cost afterwards.
    pub async fn reserve(&self, key: &str, cost: f64, priority: u8) -> Result<RateLimitResult> {
        self.decide(key, cost, priority, false).await
    }

    async fn decide(
        &self,
        key: &str,
        cost: f64,
        priority: u8,
        use_cache: bool,
    ) -> Result<RateLimitResult> {
        validate::validate_key(key)?;
        validate::validate_cost(cost)?;
        validate::validate_priority(priority)?;

        let full_key = self.full_key(key);
        let now = self.clock.now_ms();

        trace!(key = %full_key, cost, priority, "Checking rate limit");

        if use_cache {
            if let Some(result) = self.cached(&full_key, cost, now) {
                trace!(key = %full_key, allowed = result.allowed, "Serving cached decision");
                return Ok(result);
            }
        }

        let cell = self.cell(&full_key, now);
        let (slot, in_flight) = match SlotGuard::acquire(&cell) {
            Ok(acquired) => acquired,
            Err(in_flight) => {
                warn!(
                    key = %full_key,
                    in_flight,
                    max = self.limits.concurrency,
                    "Concurrency ceiling reached"
                );
                let result = RateLimitResult {
                    allowed: false,
                    remaining: 0,
                    reset_at: now,
                    wait_time: None,
                    cost,
                };
                self.metrics.record(&full_key, &result, in_flight, now);
                return Ok(result);
            }
        };

        self.load_remote(&full_key, &cell).await;

        let (result, snapshot) = {
            let mut state = cell.lock();
            let now = self.clock.now_ms();
            let result = self
                .config
                .algorithm
                .strategy()
                .evaluate(&mut state, &self.limits, cost, now);

            state.requests += 1;
            if !result.allowed {
                state.rejected += 1;
            }
            state.record(HistoryEntry {
                timestamp: now,
                allowed: result.allowed,
                cost,
            });

            (result, self.storage.is_some().then(|| state.clone()))
        };

        if let Some(state) = snapshot {
            self.store_remote(&full_key, &state).await;
        }
        drop(slot);

        let now = self.clock.now_ms();
        self.metrics.record(&full_key, &result, in_flight, now);
        if self.config.cache_ttl_ms > 0 {
            self.cache.insert(
                full_key.clone(),
                CacheEntry {
                    result,
                    expires_at: now + self.config.cache_ttl_ms as i64,
                },
            );
        }

        if result.allowed {
            trace!(key = %full_key, remaining = result.remaining, "Request admitted");
        } else {
            debug!(
                key = %full_key,
                cost,
                wait_time = ?result.wait_time,
                "Rate limit exceeded"
            );
        }

        Ok(result)
    }

    /// Poll [`Self::check_limit`] until admitted or `max_wait_ms` elapses.
    ///
    /// Returns `Ok(false)` once the deadline passes. Between attempts the
    /// task sleeps for the algorithm's suggested wait plus exponential
    /// backoff and jitter, never past the deadline.
    pub async fn wait_for_token(
        &self,
        key: &str,
        max_wait_ms: u64,
        cost: f64,
        priority: u8,
    ) -> Result<bool> {
        validate::validate_max_wait(max_wait_ms)?;

        let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut attempts = 0u32;

        loop {
            let result = self.check_limit(key, cost, priority).await?;
            attempts += 1;
            if result.allowed {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key, attempts, max_wait_ms, "Gave up waiting for token");
                return Ok(false);
            }

            let budget_ms = (deadline - now).as_millis() as u64;
            let jitter_ms = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
            let delay_ms = (result.wait_time.unwrap_or(0) + backoff_ms as u64 + jitter_ms)
                .min(budget_ms);

            trace!(key, attempts, delay_ms, "Waiting for token");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            if Instant::now() > deadline {
                debug!(key, attempts, max_wait_ms, "Gave up waiting for token");
                return Ok(false);
            }

            backoff_ms = (backoff_ms * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS);
        }
    }

    /// Current capacity for `key` without consuming any.
    pub async fn get_status(&self, key: &str) -> Result<RateLimitResult> {
        validate::validate_key(key)?;
        let full_key = self.full_key(key);

        let mut state = self
            .states
            .get(&full_key)
            .map(|cell| cell.lock().clone());

        if let Some(storage) = &self.storage {
            match Self::fetch_remote(storage.as_ref(), &full_key).await {
                Ok(Some(remote)) => state = Some(remote),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %full_key, error = %e, "Shared state unavailable, using local state");
                }
            }
        }

        let now = self.clock.now_ms();
        let state = state.unwrap_or_else(|| RateLimitState::new(&self.limits, now));
        Ok(self
            .config
            .algorithm
            .strategy()
            .status(&state, &self.limits, now))
    }

    /// A copy of the process-local state for `key`, if it exists.
    pub fn state(&self, key: &str) -> Option<RateLimitState> {
        let full_key = self.full_key(key);
        self.states.get(&full_key).map(|cell| cell.lock().clone())
    }

    /// Apply `f` to the state for `key` under its lock.
    ///
    /// The state is created if missing, refreshed from shared storage, and
    /// refilled for elapsed time before `f` runs. Afterwards tokens are
    /// clamped to `[0, burst]`, the state is persisted, and any cached
    /// decision for the key is dropped.
    pub async fn update_state<F, R>(&self, key: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut RateLimitState, &Limits) -> R,
    {
        validate::validate_key(key)?;
        let full_key = self.full_key(key);
        let now = self.clock.now_ms();
        let cell = self.cell(&full_key, now);

        self.load_remote(&full_key, &cell).await;

        let (output, snapshot) = {
            let mut state = cell.lock();
            self.config
                .algorithm
                .strategy()
                .refill(&mut state, &self.limits, self.clock.now_ms());
            let output = f(&mut state, &self.limits);
            state.clamp_tokens(self.limits.burst);
            (output, self.storage.is_some().then(|| state.clone()))
        };

        if let Some(state) = snapshot {
            self.store_remote(&full_key, &state).await;
        }
        self.cache.remove(&full_key);

        Ok(output)
    }

    /// Metrics for a single key.
    pub fn get_metrics(&self, key: &str) -> Option<RateLimitMetrics> {
        self.metrics.get(&self.full_key(key))
    }

    /// Metrics for every key this limiter has seen.
    pub fn get_all_metrics(&self) -> HashMap<String, RateLimitMetrics> {
        self.metrics.snapshot()
    }

    /// Number of keys with live state.
    pub fn key_count(&self) -> usize {
        self.states.len()
    }

    /// Stop the background sweep and clear all state.
    pub fn destroy(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        self.states.clear();
        self.cache.clear();
        self.metrics.clear();
        info!(key_prefix = %self.config.key_prefix, "Rate limiter destroyed");
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("keys", &self.states.len())
            .field("distributed", &self.storage.is_some())
            .finish()
    }
}
