//! Composite REST / GraphQL / storefront limiter.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::tier::{
    PlanTier, TierLimits, DEFAULT_REST_REQUESTS_PER_MINUTE, STOREFRONT_REQUESTS_PER_MINUTE,
};
use crate::error::Result;
use crate::ratelimit::validate;
use crate::ratelimit::{
    Algorithm, Clock, HistoryEntry, RateLimitConfig, RateLimitMetrics, RateLimitResult,
    RateLimiter, StorageBackend, SystemClock, DEFAULT_CACHE_TTL_MS, DEFAULT_COST,
    DEFAULT_PRIORITY,
};

const REST_WINDOW_MS: u64 = 60_000;
const GRAPHQL_WINDOW_MS: u64 = 1_000;
const STOREFRONT_WINDOW_MS: u64 = 60_000;

/// Configuration for [`ShopifyRateLimiter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopifyConfig {
    /// Plan tier selecting the GraphQL budget
    #[serde(default)]
    pub plan_tier: PlanTier,

    /// REST requests per minute
    #[serde(default)]
    pub rest_api_limit: Option<u64>,

    /// GraphQL points per second, overriding the tier
    #[serde(default)]
    pub graphql_limit: Option<u64>,

    /// GraphQL points restored per second, overriding the tier
    #[serde(default)]
    pub graphql_restore_rate: Option<f64>,

    /// GraphQL bucket size, overriding the tier
    #[serde(default)]
    pub graphql_bucket_size: Option<f64>,

    /// Prefix for the three budgets' keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Decision cache lifetime for all three budgets
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

fn default_key_prefix() -> String {
    "shopify".to_string()
}

fn default_cache_ttl_ms() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

impl Default for ShopifyConfig {
    fn default() -> Self {
        Self {
            plan_tier: PlanTier::default(),
            rest_api_limit: None,
            graphql_limit: None,
            graphql_restore_rate: None,
            graphql_bucket_size: None,
            key_prefix: default_key_prefix(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl ShopifyConfig {
    pub fn for_tier(plan_tier: PlanTier) -> Self {
        Self {
            plan_tier,
            ..Self::default()
        }
    }

    /// The tier's GraphQL budget with overrides applied.
    pub fn tier_limits(&self) -> TierLimits {
        let tier = self.plan_tier.limits();
        TierLimits {
            points_per_second: self.graphql_limit.unwrap_or(tier.points_per_second),
            restore_rate: self.graphql_restore_rate.unwrap_or(tier.restore_rate),
            bucket_size: self.graphql_bucket_size.unwrap_or(tier.bucket_size),
        }
    }

    fn rest_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(
            self.rest_api_limit.unwrap_or(DEFAULT_REST_REQUESTS_PER_MINUTE),
            REST_WINDOW_MS,
        )
        .with_algorithm(Algorithm::TokenBucket)
        .with_key_prefix(format!("{}:rest", self.key_prefix))
        .with_cache_ttl_ms(self.cache_ttl_ms)
    }

    fn graphql_config(&self) -> RateLimitConfig {
        let tier = self.tier_limits();
        RateLimitConfig::new(tier.points_per_second, GRAPHQL_WINDOW_MS)
            .with_algorithm(Algorithm::LeakyBucket)
            .with_restore_rate(tier.restore_rate)
            .with_burst(tier.bucket_size)
            .with_key_prefix(format!("{}:graphql", self.key_prefix))
            .with_cache_ttl_ms(self.cache_ttl_ms)
    }

    fn storefront_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(STOREFRONT_REQUESTS_PER_MINUTE, STOREFRONT_WINDOW_MS)
            .with_algorithm(Algorithm::TokenBucket)
            .with_key_prefix(format!("{}:storefront", self.key_prefix))
            .with_cache_ttl_ms(self.cache_ttl_ms)
    }
}

/// Capacity of each budget for one store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShopifyStatus {
    pub rest: RateLimitResult,
    pub graphql: RateLimitResult,
    pub storefront: RateLimitResult,
}

/// The three limiters built for one configuration.
struct Budgets {
    config: ShopifyConfig,
    rest: Arc<RateLimiter>,
    graphql: Arc<RateLimiter>,
    storefront: Arc<RateLimiter>,
}

impl Budgets {
    fn build(
        config: ShopifyConfig,
        storage: &Option<Arc<dyn StorageBackend>>,
        clock: &Arc<dyn Clock>,
    ) -> Result<Self> {
        let make = |limiter_config: RateLimitConfig| -> Result<Arc<RateLimiter>> {
            RateLimiter::with_clock(limiter_config, storage.clone(), Arc::clone(clock)).map(Arc::new)
        };

        Ok(Self {
            rest: make(config.rest_config())?,
            graphql: make(config.graphql_config())?,
            storefront: make(config.storefront_config())?,
            config,
        })
    }

    fn destroy(&self) {
        self.rest.destroy();
        self.graphql.destroy();
        self.storefront.destroy();
    }
}

/// Per-store REST, GraphQL, and storefront admission control.
///
/// Construct one at startup and share it; changing plan tier goes through
/// [`ShopifyRateLimiter::reconfigure`].
pub struct ShopifyRateLimiter {
    budgets: RwLock<Budgets>,
    storage: Option<Arc<dyn StorageBackend>>,
    clock: Arc<dyn Clock>,
}

impl ShopifyRateLimiter {
    pub fn new(config: ShopifyConfig) -> Result<Self> {
        Self::with_clock(config, None, Arc::new(SystemClock))
    }

    pub fn with_storage(config: ShopifyConfig, storage: Arc<dyn StorageBackend>) -> Result<Self> {
        Self::with_clock(config, Some(storage), Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ShopifyConfig,
        storage: Option<Arc<dyn StorageBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        info!(
            plan_tier = %config.plan_tier,
            key_prefix = %config.key_prefix,
            "Creating Shopify rate limiter"
        );
        let budgets = Budgets::build(config, &storage, &clock)?;
        Ok(Self {
            budgets: RwLock::new(budgets),
            storage,
            clock,
        })
    }

    pub fn config(&self) -> ShopifyConfig {
        self.budgets.read().config.clone()
    }

    /// The GraphQL budget currently in force.
    pub fn tier_limits(&self) -> TierLimits {
        self.budgets.read().config.tier_limits()
    }

    pub fn rest(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.budgets.read().rest)
    }

    pub fn graphql(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.budgets.read().graphql)
    }

    pub fn storefront(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.budgets.read().storefront)
    }

    /// Admit one REST call for `key`.
    pub async fn check_rest_limit(&self, key: &str) -> Result<RateLimitResult> {
        self.rest().check_limit(key, DEFAULT_COST, DEFAULT_PRIORITY).await
    }

    /// Admit one storefront call for `key`.
    pub async fn check_storefront_limit(&self, key: &str) -> Result<RateLimitResult> {
        self.storefront()
            .check_limit(key, DEFAULT_COST, DEFAULT_PRIORITY)
            .await
    }

    /// Reserve `requested_cost` GraphQL points for `key`.
    ///
    /// Every call is charged against the bucket; the decision cache is not
    /// consulted since each query spends points.
    ///
    /// When `actual_cost` is known and lower, the difference goes straight
    /// back into the bucket (never past the bucket size) and the returned
    /// `remaining` reflects the refund.
    pub async fn check_graphql_limit(
        &self,
        key: &str,
        requested_cost: f64,
        actual_cost: Option<f64>,
    ) -> Result<RateLimitResult> {
        if let Some(actual) = actual_cost {
            validate::validate_cost(actual)?;
        }

        let graphql = self.graphql();
        let mut result = graphql
            .reserve(key, requested_cost, DEFAULT_PRIORITY)
            .await?;

        match actual_cost {
            Some(actual) if result.allowed && actual < requested_cost => {
                let tokens = Self::credit(&graphql, key, requested_cost - actual).await?;
                result.remaining = tokens.floor() as u64;
                debug!(
                    key,
                    requested_cost,
                    actual_cost = actual,
                    tokens,
                    "Refunded unused GraphQL points"
                );
            }
            _ => {}
        }

        Ok(result)
    }

    /// Return `amount` unused GraphQL points to `key`'s bucket.
    ///
    /// Returns the token balance after the refund.
    pub async fn refund_graphql_cost(&self, key: &str, amount: f64) -> Result<f64> {
        validate::validate_cost(amount)?;
        Self::credit(&self.graphql(), key, amount).await
    }

    async fn credit(graphql: &RateLimiter, key: &str, amount: f64) -> Result<f64> {
        graphql
            .update_state(key, |state, limits| {
                state.tokens = (state.tokens + amount).min(limits.burst);
                state.tokens
            })
            .await
    }

    /// Debit a cost that was already incurred.
    ///
    /// Unlike [`Self::check_graphql_limit`] this never rejects: the call has
    /// happened, so the bucket is drained (down to zero at most) to match.
    pub async fn record_graphql_cost(&self, key: &str, cost: f64) -> Result<RateLimitResult> {
        validate::validate_cost(cost)?;

        let graphql = self.graphql();
        let now = self.clock.now_ms();
        let (tokens, until_full_ms) = graphql
            .update_state(key, |state, limits| {
                state.tokens = (state.tokens - cost).max(0.0);
                state.requests += 1;
                state.record(HistoryEntry {
                    timestamp: now,
                    allowed: true,
                    cost,
                });
                let until_full = (limits.burst - state.tokens) / limits.restore_rate * 1000.0;
                (state.tokens, until_full.ceil() as i64)
            })
            .await?;

        debug!(key, cost, tokens, "Recorded GraphQL cost");
        Ok(RateLimitResult::allowed(tokens, now + until_full_ms, cost))
    }

    /// Wait up to `max_wait_ms` for a REST slot.
    pub async fn wait_for_rest_token(&self, key: &str, max_wait_ms: u64) -> Result<bool> {
        self.rest()
            .wait_for_token(key, max_wait_ms, DEFAULT_COST, DEFAULT_PRIORITY)
            .await
    }

    /// Wait up to `max_wait_ms` for `cost` GraphQL points.
    pub async fn wait_for_graphql_token(&self, key: &str, cost: f64, max_wait_ms: u64) -> Result<bool> {
        self.graphql()
            .wait_for_token(key, max_wait_ms, cost, DEFAULT_PRIORITY)
            .await
    }

    /// Capacity of every budget for `key`, without consuming any.
    pub async fn status(&self, key: &str) -> Result<ShopifyStatus> {
        let (rest, graphql, storefront) = {
            let budgets = self.budgets.read();
            (
                Arc::clone(&budgets.rest),
                Arc::clone(&budgets.graphql),
                Arc::clone(&budgets.storefront),
            )
        };
        Ok(ShopifyStatus {
            rest: rest.get_status(key).await?,
            graphql: graphql.get_status(key).await?,
            storefront: storefront.get_status(key).await?,
        })
    }

    /// Metrics across all three budgets, keyed by prefixed key.
    pub fn all_metrics(&self) -> HashMap<String, RateLimitMetrics> {
        let budgets = self.budgets.read();
        let mut metrics = budgets.rest.get_all_metrics();
        metrics.extend(budgets.graphql.get_all_metrics());
        metrics.extend(budgets.storefront.get_all_metrics());
        metrics
    }

    /// Replace the configuration, rebuilding all three limiters.
    ///
    /// No state carries over. On a validation error the current limiters
    /// stay in place.
    pub fn reconfigure(&self, config: ShopifyConfig) -> Result<()> {
        let fresh = Budgets::build(config, &self.storage, &self.clock)?;
        let old = std::mem::replace(&mut *self.budgets.write(), fresh);
        old.destroy();

        info!(
            from = %old.config.plan_tier,
            to = %self.budgets.read().config.plan_tier,
            "Shopify rate limiter reconfigured"
        );
        Ok(())
    }

    /// Stop background work and clear every budget.
    pub fn destroy(&self) {
        self.budgets.read().destroy();
    }
}

impl std::fmt::Debug for ShopifyRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopifyRateLimiter")
            .field("config", &self.budgets.read().config)
            .field("distributed", &self.storage.is_some())
            .finish()
    }
}
