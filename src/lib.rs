//! Tollgate - Admission Control for Downstream API Budgets
//!
//! This crate implements a multi-algorithm rate limiter that callers consult
//! before spending a scarce external API budget. Per-key state can be kept
//! in-process or shared between instances through a pluggable storage port,
//! and a Shopify-style composite limiter layers REST, cost-weighted GraphQL,
//! and storefront budgets on top of the core.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod registry;
pub mod shopify;

pub use config::TollgateConfig;
pub use error::{Result, TollgateError};
pub use ratelimit::{Algorithm, RateLimitConfig, RateLimitResult, RateLimiter};
pub use registry::LimiterSet;
pub use shopify::{PlanTier, ShopifyConfig, ShopifyRateLimiter};
