//! Shopify plan tiers and their API budgets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// REST requests per minute when no override is configured.
pub const DEFAULT_REST_REQUESTS_PER_MINUTE: u64 = 40;
/// Storefront requests per minute; high enough to be effectively unbounded.
pub const STOREFRONT_REQUESTS_PER_MINUTE: u64 = 1_000_000;

/// A merchant's plan, which determines their GraphQL cost budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Standard,
    Advanced,
    Plus,
    Enterprise,
}

/// GraphQL budget for a plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierLimits {
    /// Query points admitted per second
    pub points_per_second: u64,
    /// Points restored per second
    pub restore_rate: f64,
    /// Maximum points a store may bank
    pub bucket_size: f64,
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Standard,
        PlanTier::Advanced,
        PlanTier::Plus,
        PlanTier::Enterprise,
    ];

    /// The GraphQL budget for this tier.
    pub fn limits(&self) -> TierLimits {
        let (points_per_second, bucket_size) = match self {
            PlanTier::Standard => (50, 1_000.0),
            PlanTier::Advanced => (100, 2_000.0),
            PlanTier::Plus => (500, 10_000.0),
            PlanTier::Enterprise => (1_000, 20_000.0),
        };
        TierLimits {
            points_per_second,
            restore_rate: points_per_second as f64,
            bucket_size,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Standard => "standard",
            PlanTier::Advanced => "advanced",
            PlanTier::Plus => "plus",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_table() {
        let standard = PlanTier::Standard.limits();
        assert_eq!(standard.points_per_second, 50);
        assert_eq!(standard.restore_rate, 50.0);
        assert_eq!(standard.bucket_size, 1_000.0);

        assert_eq!(PlanTier::Plus.limits().bucket_size, 10_000.0);
    }

    #[test]
    fn test_tiers_grow_monotonically() {
        let sizes: Vec<f64> = PlanTier::ALL.iter().map(|t| t.limits().bucket_size).collect();
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_tier_serde() {
        let tier: PlanTier = serde_yaml::from_str("enterprise").unwrap();
        assert_eq!(tier, PlanTier::Enterprise);
        assert_eq!(PlanTier::default(), PlanTier::Standard);
        assert_eq!(PlanTier::Advanced.to_string(), "advanced");
    }
}
