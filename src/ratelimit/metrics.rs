//! Per-key admission metrics.

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use serde::Serialize;

use super::state::RateLimitResult;

/// Maximum number of samples kept in [`RateLimitMetrics::history`].
pub const METRICS_HISTORY_CAPACITY: usize = 100;
/// Width of one history sample bucket.
const SAMPLE_BUCKET_MS: i64 = 1_000;

/// Requests and rejections observed during one sample bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSample {
    /// Start of the bucket (epoch ms)
    pub timestamp: i64,
    pub requests: u64,
    pub rejected: u64,
}

/// Concurrency observed across checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConcurrencyMetrics {
    pub average: f64,
    pub peak: u32,
}

/// Aggregated admission statistics for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimitMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
    /// `rejected_requests / total_requests`
    pub rejection_rate: f64,
    /// Mean suggested wait across rejections that carried one
    pub average_wait_time_ms: f64,
    pub average_cost: f64,
    pub concurrency: ConcurrencyMetrics,
    pub history: VecDeque<MetricsSample>,
    /// Last time this key was recorded (epoch ms)
    pub last_updated: i64,
    #[serde(skip)]
    wait_samples: u64,
    #[serde(skip)]
    wait_total: f64,
    #[serde(skip)]
    cost_total: f64,
    #[serde(skip)]
    concurrency_total: u64,
}

impl RateLimitMetrics {
    fn observe(&mut self, result: &RateLimitResult, in_flight: u32, now: i64) {
        self.total_requests += 1;
        let n = self.total_requests as f64;

        if result.allowed {
            self.allowed_requests += 1;
        } else {
            self.rejected_requests += 1;
        }
        self.rejection_rate = self.rejected_requests as f64 / n;
        self.cost_total += result.cost;
        self.average_cost = self.cost_total / n;

        if let Some(wait) = result.wait_time {
            self.wait_samples += 1;
            self.wait_total += wait as f64;
            self.average_wait_time_ms = self.wait_total / self.wait_samples as f64;
        }

        self.concurrency_total += u64::from(in_flight);
        self.concurrency.average = self.concurrency_total as f64 / n;
        self.concurrency.peak = self.concurrency.peak.max(in_flight);

        let bucket = now.div_euclid(SAMPLE_BUCKET_MS) * SAMPLE_BUCKET_MS;
        match self.history.back_mut() {
            Some(sample) if sample.timestamp == bucket => {
                sample.requests += 1;
                sample.rejected += u64::from(!result.allowed);
            }
            _ => {
                if self.history.len() >= METRICS_HISTORY_CAPACITY {
                    self.history.pop_front();
                }
                self.history.push_back(MetricsSample {
                    timestamp: bucket,
                    requests: 1,
                    rejected: u64::from(!result.allowed),
                });
            }
        }

        self.last_updated = now;
    }
}

/// Thread-safe map of key to metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    entries: DashMap<String, RateLimitMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one decision into the key's metrics.
    pub fn record(&self, key: &str, result: &RateLimitResult, in_flight: u32, now: i64) {
        self.entries
            .entry(key.to_string())
            .or_default()
            .observe(result, in_flight, now);
    }

    pub fn get(&self, key: &str) -> Option<RateLimitMetrics> {
        self.entries.get(key).map(|m| m.clone())
    }

    pub fn snapshot(&self) -> HashMap<String, RateLimitMetrics> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Drop keys idle since before `cutoff`. Returns how many were removed.
    pub fn sweep(&self, cutoff: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, m| m.last_updated >= cutoff);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(cost: f64) -> RateLimitResult {
        RateLimitResult::allowed(5.0, 0, cost)
    }

    fn rejected(wait: u64) -> RateLimitResult {
        RateLimitResult::rejected(0.0, 0, wait, 1.0)
    }

    #[test]
    fn test_totals_and_rates() {
        let registry = MetricsRegistry::new();
        registry.record("k", &allowed(1.0), 1, 0);
        registry.record("k", &allowed(3.0), 2, 10);
        registry.record("k", &rejected(400), 1, 20);
        registry.record("k", &rejected(200), 4, 30);

        let m = registry.get("k").unwrap();
        assert_eq!(m.total_requests, 4);
        assert_eq!(m.allowed_requests, 2);
        assert_eq!(m.rejected_requests, 2);
        assert_eq!(m.rejection_rate, 0.5);
        assert_eq!(m.average_wait_time_ms, 300.0);
        assert_eq!(m.average_cost, 1.5);
        assert_eq!(m.concurrency.average, 2.0);
        assert_eq!(m.concurrency.peak, 4);
        assert_eq!(m.last_updated, 30);
    }

    #[test]
    fn test_history_buckets_per_second() {
        let registry = MetricsRegistry::new();
        registry.record("k", &allowed(1.0), 1, 100);
        registry.record("k", &rejected(10), 1, 900);
        registry.record("k", &allowed(1.0), 1, 1_100);

        let m = registry.get("k").unwrap();
        assert_eq!(m.history.len(), 2);
        assert_eq!(
            m.history[0],
            MetricsSample {
                timestamp: 0,
                requests: 2,
                rejected: 1
            }
        );
        assert_eq!(m.history[1].timestamp, 1_000);
    }

    #[test]
    fn test_history_is_bounded() {
        let registry = MetricsRegistry::new();
        for second in 0..150 {
            registry.record("k", &allowed(1.0), 1, second * 1_000);
        }
        let m = registry.get("k").unwrap();
        assert_eq!(m.history.len(), METRICS_HISTORY_CAPACITY);
        assert_eq!(m.history.front().unwrap().timestamp, 50_000);
    }

    #[test]
    fn test_sweep_drops_idle_keys() {
        let registry = MetricsRegistry::new();
        registry.record("old", &allowed(1.0), 1, 1_000);
        registry.record("fresh", &allowed(1.0), 1, 9_000);

        assert_eq!(registry.sweep(5_000), 1);
        assert!(registry.get("old").is_none());
        assert!(registry.get("fresh").is_some());
        assert_eq!(registry.snapshot().len(), 1);
    }
}
