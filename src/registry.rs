//! Construction of an application's limiters from configuration.
//!
//! A [`LimiterSet`] is built once at startup and handed to the code that
//! calls external APIs, rather than reached through global state.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::config::TollgateConfig;
use crate::error::Result;
use crate::ratelimit::{Clock, RateLimiter, StorageBackend, SystemClock};
use crate::shopify::ShopifyRateLimiter;

/// Named limiters plus the Shopify composite, sharing one storage backend.
#[derive(Debug)]
pub struct LimiterSet {
    limiters: HashMap<String, Arc<RateLimiter>>,
    shopify: Arc<ShopifyRateLimiter>,
}

impl LimiterSet {
    /// Build process-local limiters.
    pub fn build(config: &TollgateConfig) -> Result<Self> {
        Self::build_with(config, None, Arc::new(SystemClock))
    }

    /// Build limiters that share state through `storage`.
    pub fn build_with(
        config: &TollgateConfig,
        storage: Option<Arc<dyn StorageBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut limiters = HashMap::with_capacity(config.limiters.len());
        for (name, limiter_config) in &config.limiters {
            let limiter =
                RateLimiter::with_clock(limiter_config.clone(), storage.clone(), Arc::clone(&clock))?;
            limiters.insert(name.clone(), Arc::new(limiter));
        }

        let shopify = ShopifyRateLimiter::with_clock(config.shopify.clone(), storage, clock)?;

        info!(limiters = limiters.len(), "Limiter set ready");
        Ok(Self {
            limiters,
            shopify: Arc::new(shopify),
        })
    }

    /// The limiter registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).cloned()
    }

    /// Names of all general-purpose limiters.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    pub fn shopify(&self) -> Arc<ShopifyRateLimiter> {
        Arc::clone(&self.shopify)
    }

    /// Tear down every limiter.
    pub fn destroy(&self) {
        for limiter in self.limiters.values() {
            limiter.destroy();
        }
        self.shopify.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryStorage;
    use crate::shopify::PlanTier;

    const SAMPLE: &str = r#"
limiters:
  gemini:
    max_requests: 2
    window_ms: 60000
    key_prefix: gemini
    cache_ttl_ms: 0
shopify:
  plan_tier: advanced
"#;

    #[tokio::test]
    async fn test_build_from_config() {
        let config = TollgateConfig::from_yaml(SAMPLE).unwrap();
        let set = LimiterSet::build(&config).unwrap();

        assert_eq!(set.names().collect::<Vec<_>>(), vec!["gemini"]);
        assert!(set.get("missing").is_none());
        assert_eq!(set.shopify().config().plan_tier, PlanTier::Advanced);

        let gemini = set.get("gemini").unwrap();
        assert!(gemini.check_limit("article-42", 1.0, 5).await.unwrap().allowed);
        assert!(gemini.check_limit("article-42", 1.0, 5).await.unwrap().allowed);
        assert!(!gemini.check_limit("article-42", 1.0, 5).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_invalid_limiter_fails_build() {
        let config = TollgateConfig::from_yaml(
            "limiters:\n  bad:\n    max_requests: 1\n    window_ms: 1000\n    concurrency: 0\n",
        )
        .unwrap();
        assert!(LimiterSet::build(&config).is_err());
    }

    #[tokio::test]
    async fn test_sets_share_storage() {
        let config = TollgateConfig::from_yaml(SAMPLE).unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let first = LimiterSet::build_with(&config, Some(storage.clone()), clock.clone()).unwrap();
        let second = LimiterSet::build_with(&config, Some(storage), clock).unwrap();

        let a = first.get("gemini").unwrap();
        let b = second.get("gemini").unwrap();
        assert!(a.check_limit("k", 1.0, 5).await.unwrap().allowed);
        assert!(b.check_limit("k", 1.0, 5).await.unwrap().allowed);
        assert!(!a.check_limit("k", 1.0, 5).await.unwrap().allowed);

        first.destroy();
        second.destroy();
        assert_eq!(a.key_count(), 0);
    }
}
