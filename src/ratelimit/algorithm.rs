//! Throttling algorithms.
//!
//! Every algorithm operates on the same [`RateLimitState`] and differs only in
//! how capacity is restored and accounted. The [`Algorithm`] enum selects a
//! strategy; the strategies themselves are stateless unit structs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::state::{Limits, RateLimitResult, RateLimitState};
use crate::error::TollgateError;

/// A capacity accounting rule.
pub trait RateLimitAlgorithm: Send + Sync {
    /// Restore capacity for the time elapsed up to `now`.
    fn refill(&self, state: &mut RateLimitState, limits: &Limits, now: i64);

    /// Refill, then try to consume `cost`.
    fn evaluate(
        &self,
        state: &mut RateLimitState,
        limits: &Limits,
        cost: f64,
        now: i64,
    ) -> RateLimitResult;

    /// Project the current capacity without consuming it.
    fn status(&self, state: &RateLimitState, limits: &Limits, now: i64) -> RateLimitResult {
        let mut projected = state.clone();
        let mut result = self.evaluate(&mut projected, limits, 1.0, now);
        if result.allowed {
            // the projection consumed one unit; give it back
            result.remaining += 1;
        }
        result.cost = 0.0;
        result
    }
}

/// Which accounting rule a limiter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Window-quantized refill
    #[default]
    TokenBucket,
    /// Continuous refill at `restore_rate`
    LeakyBucket,
    /// Moving lookback over recent decisions
    SlidingWindow,
    /// Full reset at calendar window boundaries
    FixedWindow,
}

impl Algorithm {
    /// All known algorithms.
    pub const ALL: [Algorithm; 4] = [
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
        Algorithm::SlidingWindow,
        Algorithm::FixedWindow,
    ];

    /// The configuration name of this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token-bucket",
            Algorithm::LeakyBucket => "leaky-bucket",
            Algorithm::SlidingWindow => "sliding-window",
            Algorithm::FixedWindow => "fixed-window",
        }
    }

    /// The strategy implementing this algorithm.
    pub fn strategy(&self) -> &'static dyn RateLimitAlgorithm {
        match self {
            Algorithm::TokenBucket => &TokenBucket,
            Algorithm::LeakyBucket => &LeakyBucket,
            Algorithm::SlidingWindow => &SlidingWindow,
            Algorithm::FixedWindow => &FixedWindow,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| {
                TollgateError::invalid(
                    "algorithm",
                    format!(
                        "unknown algorithm '{}', expected one of token-bucket, leaky-bucket, sliding-window, fixed-window",
                        s
                    ),
                )
            })
    }
}

fn ceil_ms(ms: f64) -> u64 {
    if ms.is_finite() && ms > 0.0 {
        ms.ceil() as u64
    } else {
        0
    }
}

/// Tokens accrue in whole units per elapsed fraction of the window.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket;

impl RateLimitAlgorithm for TokenBucket {
    fn refill(&self, state: &mut RateLimitState, limits: &Limits, now: i64) {
        let elapsed = (now - state.last_refill).max(0) as f64;
        let to_add = (elapsed / limits.window_ms as f64 * limits.max_requests as f64).floor();
        if to_add > 0.0 {
            state.tokens = (state.tokens + to_add).min(limits.burst);
            state.last_refill = now;
        }
    }

    fn evaluate(
        &self,
        state: &mut RateLimitState,
        limits: &Limits,
        cost: f64,
        now: i64,
    ) -> RateLimitResult {
        self.refill(state, limits, now);

        if state.tokens >= cost {
            state.tokens -= cost;
            RateLimitResult::allowed(state.tokens, state.last_refill + limits.window_ms as i64, cost)
        } else {
            let wait = ceil_ms(
                (cost - state.tokens) / limits.max_requests as f64 * limits.window_ms as f64,
            );
            RateLimitResult::rejected(state.tokens, now + wait as i64, wait, cost)
        }
    }
}

/// Tokens drip back continuously at `restore_rate` per second.
#[derive(Debug, Clone, Copy)]
pub struct LeakyBucket;

impl RateLimitAlgorithm for LeakyBucket {
    fn refill(&self, state: &mut RateLimitState, limits: &Limits, now: i64) {
        let elapsed_secs = (now - state.last_refill).max(0) as f64 / 1000.0;
        state.tokens = (state.tokens + elapsed_secs * limits.restore_rate).min(limits.burst);
        state.last_refill = state.last_refill.max(now);
    }

    fn evaluate(
        &self,
        state: &mut RateLimitState,
        limits: &Limits,
        cost: f64,
        now: i64,
    ) -> RateLimitResult {
        self.refill(state, limits, now);

        if state.tokens >= cost {
            state.tokens -= cost;
            let until_full = ceil_ms((limits.burst - state.tokens) / limits.restore_rate * 1000.0);
            RateLimitResult::allowed(state.tokens, now + until_full as i64, cost)
        } else {
            let wait = ceil_ms((cost - state.tokens) / limits.restore_rate * 1000.0);
            RateLimitResult::rejected(state.tokens, now + wait as i64, wait, cost)
        }
    }
}

/// Admission bounded by the allowed decisions inside a moving lookback.
#[derive(Debug, Clone, Copy)]
pub struct SlidingWindow;

impl SlidingWindow {
    /// Count and summed cost of allowed entries still inside the window,
    /// plus the oldest such timestamp.
    fn window_usage(state: &RateLimitState) -> (u64, f64, Option<i64>) {
        state
            .history
            .iter()
            .filter(|e| e.allowed)
            .fold((0, 0.0, None), |(count, used, oldest), e| {
                (count + 1, used + e.cost, oldest.or(Some(e.timestamp)))
            })
    }
}

impl RateLimitAlgorithm for SlidingWindow {
    fn refill(&self, state: &mut RateLimitState, limits: &Limits, now: i64) {
        let cutoff = now - limits.window_ms as i64;
        while state
            .history
            .front()
            .is_some_and(|entry| entry.timestamp <= cutoff)
        {
            state.history.pop_front();
        }

        let (_, used, _) = Self::window_usage(state);
        state.tokens = (limits.burst - used).clamp(0.0, limits.burst);
    }

    fn evaluate(
        &self,
        state: &mut RateLimitState,
        limits: &Limits,
        cost: f64,
        now: i64,
    ) -> RateLimitResult {
        self.refill(state, limits, now);

        let (count, used, oldest) = Self::window_usage(state);
        let window = limits.window_ms as i64;

        if count < limits.max_requests && used + cost <= limits.burst {
            state.tokens = (limits.burst - used - cost).clamp(0.0, limits.burst);
            let slots = (limits.max_requests - count - 1) as f64;
            RateLimitResult::allowed(slots.min(state.tokens), oldest.unwrap_or(now) + window, cost)
        } else {
            let reset_at = oldest.map_or(now + window, |ts| ts + window);
            let slots = limits.max_requests.saturating_sub(count) as f64;
            let wait = (reset_at - now).max(0) as u64;
            RateLimitResult::rejected(slots.min(state.tokens), reset_at, wait, cost)
        }
    }
}

/// Capacity resets to `burst` at each multiple of `window_ms`.
///
/// Allows up to twice the configured rate across a boundary.
#[derive(Debug, Clone, Copy)]
pub struct FixedWindow;

impl FixedWindow {
    fn boundary(limits: &Limits, now: i64) -> i64 {
        let window = limits.window_ms as i64;
        now.div_euclid(window) * window
    }
}

impl RateLimitAlgorithm for FixedWindow {
    fn refill(&self, state: &mut RateLimitState, limits: &Limits, now: i64) {
        let boundary = Self::boundary(limits, now);
        if state.last_refill < boundary {
            state.tokens = limits.burst;
            state.last_refill = boundary;
        }
    }

    fn evaluate(
        &self,
        state: &mut RateLimitState,
        limits: &Limits,
        cost: f64,
        now: i64,
    ) -> RateLimitResult {
        self.refill(state, limits, now);
        let window_end = Self::boundary(limits, now) + limits.window_ms as i64;

        if state.tokens >= cost {
            state.tokens -= cost;
            RateLimitResult::allowed(state.tokens, window_end, cost)
        } else {
            let wait = (window_end - now).max(0) as u64;
            RateLimitResult::rejected(state.tokens, window_end, wait, cost)
        }
    }
}
