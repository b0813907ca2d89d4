//! Configuration management for Tollgate.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimitConfig;
use crate::shopify::ShopifyConfig;

/// Prefix for environment variable overrides, e.g. `TOLLGATE__SHOPIFY__PLAN_TIER`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for an application's limiters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Named general-purpose limiters, e.g. one per generative API
    #[serde(default)]
    pub limiters: HashMap<String, RateLimitConfig>,

    /// Commerce platform budgets
    #[serde(default)]
    pub shopify: ShopifyConfig,
}

impl TollgateConfig {
    /// Load configuration from a file, layered with environment overrides.
    ///
    /// The format is inferred from the extension (YAML, TOML, JSON).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        if !path.exists() {
            return Err(TollgateError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    /// Validate every limiter without building it.
    pub fn validate(&self) -> Result<()> {
        for (name, limiter) in &self.limiters {
            limiter.resolve().map_err(|e| match e {
                TollgateError::InvalidArgument { field, message } => TollgateError::Config(
                    format!("limiter '{}': invalid `{}`: {}", name, field, message),
                ),
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Algorithm;
    use crate::shopify::PlanTier;

    const SAMPLE: &str = r#"
limiters:
  gemini:
    max_requests: 60
    window_ms: 60000
    algorithm: sliding-window
    concurrency: 4
    key_prefix: gemini
  embeddings:
    max_requests: 10
    window_ms: 1000
shopify:
  plan_tier: plus
  rest_api_limit: 80
"#;

    #[test]
    fn test_from_yaml() {
        let config = TollgateConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.limiters.len(), 2);

        let gemini = &config.limiters["gemini"];
        assert_eq!(gemini.algorithm, Algorithm::SlidingWindow);
        assert_eq!(gemini.concurrency, Some(4));
        assert_eq!(gemini.key_prefix, "gemini");

        assert_eq!(config.limiters["embeddings"].algorithm, Algorithm::TokenBucket);
        assert_eq!(config.shopify.plan_tier, PlanTier::Plus);
        assert_eq!(config.shopify.rest_api_limit, Some(80));
        assert_eq!(config.shopify.key_prefix, "shopify");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = TollgateConfig::from_yaml("{}").unwrap();
        assert!(config.limiters.is_empty());
        assert_eq!(config.shopify, ShopifyConfig::default());
    }

    #[test]
    fn test_validate_names_limiter() {
        let config = TollgateConfig::from_yaml(
            "limiters:\n  broken:\n    max_requests: 5\n    window_ms: 0\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("broken"));
        assert!(err.contains("window_ms"));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-{}.yaml", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();

        let config = TollgateConfig::from_file(&path).unwrap();
        assert_eq!(config.limiters["gemini"].max_requests, 60);
        assert_eq!(config.shopify.plan_tier, PlanTier::Plus);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_from_missing_file() {
        let err = TollgateConfig::from_file("/nonexistent/tollgate.yaml").unwrap_err();
        assert!(matches!(err, TollgateError::Io(_)));
    }
}
