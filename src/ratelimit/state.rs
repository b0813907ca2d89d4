//! Per-key limiter state and decision values.

use std::collections::VecDeque;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of entries retained in [`RateLimitState::history`].
pub const HISTORY_CAPACITY: usize = 1000;

/// Resolved numeric limits for a limiter, after defaults are applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Requests per window
    pub max_requests: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum token capacity
    pub burst: f64,
    /// Continuous refill rate in tokens per second
    pub restore_rate: f64,
    /// Concurrency ceiling per key (`u32::MAX` when unbounded)
    pub concurrency: u32,
}

impl Limits {
    /// Milliseconds needed to refill an empty bucket to `burst`.
    pub fn full_refill_ms(&self) -> u64 {
        (self.burst / self.restore_rate * 1000.0).ceil() as u64
    }
}

/// One admission decision as remembered by the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub allowed: bool,
    pub cost: f64,
}

/// In-flight admission checks for a key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyState {
    pub current: u32,
    pub max: u32,
}

/// Mutable state for a single logical key.
///
/// `tokens` stays within `[0, burst]` and `history` never exceeds
/// [`HISTORY_CAPACITY`] entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Fractional token balance
    pub tokens: f64,
    /// Last refill instant, or window start for the fixed window (epoch ms)
    pub last_refill: i64,
    /// Checks evaluated against this state
    pub requests: u64,
    /// Checks the algorithm rejected
    pub rejected: u64,
    /// Recent decisions, oldest first
    pub history: VecDeque<HistoryEntry>,
    /// Concurrency slots in use
    pub concurrency: ConcurrencyState,
}

impl RateLimitState {
    /// A full bucket created at `now`.
    pub fn new(limits: &Limits, now: i64) -> Self {
        Self {
            tokens: limits.burst,
            last_refill: now,
            requests: 0,
            rejected: 0,
            history: VecDeque::new(),
            concurrency: ConcurrencyState {
                current: 0,
                max: limits.concurrency,
            },
        }
    }

    /// Append a decision, keeping at most [`HISTORY_CAPACITY`] entries.
    ///
    /// At capacity the oldest rejected entry makes room. Allowed entries are
    /// only evicted by another allowed entry, and a rejection arriving when
    /// the history holds nothing but allowed entries is not stored.
    pub fn record(&mut self, entry: HistoryEntry) {
        if self.history.len() >= HISTORY_CAPACITY {
            match self.history.iter().position(|e| !e.allowed) {
                Some(index) => {
                    self.history.remove(index);
                }
                None if entry.allowed => {
                    self.history.pop_front();
                }
                None => return,
            }
        }
        self.history.push_back(entry);
    }

    /// Adopt the accounting fields of a state loaded from shared storage.
    ///
    /// Concurrency slots are process-local and are left untouched.
    pub fn absorb(&mut self, remote: RateLimitState) {
        self.tokens = remote.tokens;
        self.last_refill = remote.last_refill;
        self.requests = remote.requests;
        self.rejected = remote.rejected;
        self.history = remote.history;
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }

    /// Force `tokens` back into `[0, burst]`.
    pub fn clamp_tokens(&mut self, burst: f64) {
        if !self.tokens.is_finite() || self.tokens < 0.0 {
            self.tokens = 0.0;
        } else if self.tokens > burst {
            self.tokens = burst;
        }
    }
}

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Whether the caller may proceed
    pub allowed: bool,
    /// Whole units of capacity left
    pub remaining: u64,
    /// When the key next has capacity (epoch ms)
    pub reset_at: i64,
    /// Suggested delay before retrying, in milliseconds
    pub wait_time: Option<u64>,
    /// Cost that was requested
    pub cost: f64,
}

impl RateLimitResult {
    pub(crate) fn allowed(tokens: f64, reset_at: i64, cost: f64) -> Self {
        Self {
            allowed: true,
            remaining: floor_remaining(tokens),
            reset_at,
            wait_time: None,
            cost,
        }
    }

    pub(crate) fn rejected(tokens: f64, reset_at: i64, wait_time: u64, cost: f64) -> Self {
        Self {
            allowed: false,
            remaining: floor_remaining(tokens),
            reset_at,
            wait_time: Some(wait_time),
            cost,
        }
    }

    /// `reset_at` as a UTC timestamp.
    pub fn reset_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.reset_at).single()
    }
}

fn floor_remaining(tokens: f64) -> u64 {
    if tokens.is_finite() && tokens > 0.0 {
        tokens.floor() as u64
    } else {
        0
    }
}

/// A memoized decision.
#[derive(Debug, Clone, Copy)]
pub struct CacheEntry {
    pub result: RateLimitResult,
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            max_requests: 10,
            window_ms: 1000,
            burst: 10.0,
            restore_rate: 10.0,
            concurrency: u32::MAX,
        }
    }

    #[test]
    fn test_new_state_is_full() {
        let state = RateLimitState::new(&limits(), 42);
        assert_eq!(state.tokens, 10.0);
        assert_eq!(state.last_refill, 42);
        assert_eq!(state.concurrency.max, u32::MAX);
        assert!(state.history.is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = RateLimitState::new(&limits(), 0);
        for i in 0..(HISTORY_CAPACITY as i64 + 25) {
            state.record(HistoryEntry {
                timestamp: i,
                allowed: true,
                cost: 1.0,
            });
        }
        assert_eq!(state.history.len(), HISTORY_CAPACITY);
        assert_eq!(state.history.front().map(|e| e.timestamp), Some(25));
    }

    #[test]
    fn test_rejections_never_evict_allowed_entries() {
        let mut state = RateLimitState::new(&limits(), 0);
        for i in 0..5 {
            state.record(HistoryEntry {
                timestamp: i,
                allowed: true,
                cost: 1.0,
            });
        }
        for i in 5..(HISTORY_CAPACITY as i64 * 2) {
            state.record(HistoryEntry {
                timestamp: i,
                allowed: false,
                cost: 1.0,
            });
        }

        assert_eq!(state.history.len(), HISTORY_CAPACITY);
        let allowed: Vec<i64> = state
            .history
            .iter()
            .filter(|e| e.allowed)
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(allowed, vec![0, 1, 2, 3, 4]);
        // the newest rejection is kept, the oldest ones made room
        assert_eq!(
            state.history.back().map(|e| e.timestamp),
            Some(HISTORY_CAPACITY as i64 * 2 - 1)
        );
    }

    #[test]
    fn test_full_allowed_history_drops_rejections() {
        let mut state = RateLimitState::new(&limits(), 0);
        for i in 0..HISTORY_CAPACITY as i64 {
            state.record(HistoryEntry {
                timestamp: i,
                allowed: true,
                cost: 1.0,
            });
        }
        state.record(HistoryEntry {
            timestamp: 5_000,
            allowed: false,
            cost: 1.0,
        });

        assert_eq!(state.history.len(), HISTORY_CAPACITY);
        assert!(state.history.iter().all(|e| e.allowed));
        assert_eq!(state.history.front().map(|e| e.timestamp), Some(0));
    }

    #[test]
    fn test_absorb_keeps_local_concurrency() {
        let mut local = RateLimitState::new(&limits(), 0);
        local.concurrency.current = 3;

        let mut remote = RateLimitState::new(&limits(), 500);
        remote.tokens = 2.5;
        remote.requests = 7;
        remote.concurrency.current = 9;

        local.absorb(remote);
        assert_eq!(local.tokens, 2.5);
        assert_eq!(local.requests, 7);
        assert_eq!(local.last_refill, 500);
        assert_eq!(local.concurrency.current, 3);
    }

    #[test]
    fn test_clamp_tokens() {
        let mut state = RateLimitState::new(&limits(), 0);
        state.tokens = 25.0;
        state.clamp_tokens(10.0);
        assert_eq!(state.tokens, 10.0);

        state.tokens = -3.0;
        state.clamp_tokens(10.0);
        assert_eq!(state.tokens, 0.0);
    }

    #[test]
    fn test_remaining_is_floored() {
        let result = RateLimitResult::allowed(4.9, 0, 1.0);
        assert_eq!(result.remaining, 4);

        let result = RateLimitResult::rejected(0.3, 0, 700, 1.0);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.wait_time, Some(700));
    }

    #[test]
    fn test_reset_at_utc() {
        let result = RateLimitResult::allowed(1.0, 1_704_067_200_000, 1.0);
        let ts = result.reset_at_utc().unwrap();
        assert_eq!(ts.timestamp(), 1_704_067_200);
    }
}
