//! Shopify-style composite limiter.
//!
//! Combines three core limiters per store: a REST request budget, a
//! cost-weighted GraphQL budget sized by plan tier, and a storefront budget.

mod limiter;
mod tier;

pub use limiter::{ShopifyConfig, ShopifyRateLimiter, ShopifyStatus};
pub use tier::{
    PlanTier, TierLimits, DEFAULT_REST_REQUESTS_PER_MINUTE, STOREFRONT_REQUESTS_PER_MINUTE,
};
