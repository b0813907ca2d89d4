//! Input range checks.
//!
//! These are pure functions: they never touch limiter state, so a rejected
//! call leaves everything exactly as it was.

use crate::error::{Result, TollgateError};

/// Largest cost a single check may request.
pub const MAX_COST: f64 = 1_000_000.0;
/// Largest priority value.
pub const MAX_PRIORITY: u8 = 10;
/// Longest accepted key, in characters.
pub const MAX_KEY_LEN: usize = 500;
/// Upper bound for `max_requests`.
pub const MAX_REQUESTS: u64 = 1_000_000;
/// Upper bound for `window_ms` (one hour).
pub const MAX_WINDOW_MS: u64 = 3_600_000;
/// Upper bound for `burst`.
pub const MAX_BURST: f64 = 10_000_000.0;
/// Upper bound for `restore_rate`.
pub const MAX_RESTORE_RATE: f64 = 1_000_000.0;
/// Upper bound for `concurrency`.
pub const MAX_CONCURRENCY: u32 = 100_000;
/// Longest accepted key prefix, in characters.
pub const MAX_KEY_PREFIX_LEN: usize = 100;
/// Longest a caller may wait for a token (ten minutes).
pub const MAX_WAIT_MS: u64 = 600_000;

pub fn validate_cost(cost: f64) -> Result<()> {
    if !cost.is_finite() || !(0.0..=MAX_COST).contains(&cost) {
        return Err(TollgateError::invalid(
            "cost",
            format!("must be between 0 and {}, got {}", MAX_COST, cost),
        ));
    }
    Ok(())
}

pub fn validate_priority(priority: u8) -> Result<()> {
    if priority > MAX_PRIORITY {
        return Err(TollgateError::invalid(
            "priority",
            format!("must be between 0 and {}, got {}", MAX_PRIORITY, priority),
        ));
    }
    Ok(())
}

pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(TollgateError::invalid("key", "must not be empty"));
    }
    let len = key.chars().count();
    if len > MAX_KEY_LEN {
        return Err(TollgateError::invalid(
            "key",
            format!("must be at most {} characters, got {}", MAX_KEY_LEN, len),
        ));
    }
    Ok(())
}

pub fn validate_max_requests(max_requests: u64) -> Result<()> {
    if !(1..=MAX_REQUESTS).contains(&max_requests) {
        return Err(TollgateError::invalid(
            "max_requests",
            format!("must be between 1 and {}, got {}", MAX_REQUESTS, max_requests),
        ));
    }
    Ok(())
}

pub fn validate_window_ms(window_ms: u64) -> Result<()> {
    if !(1..=MAX_WINDOW_MS).contains(&window_ms) {
        return Err(TollgateError::invalid(
            "window_ms",
            format!("must be between 1 and {}, got {}", MAX_WINDOW_MS, window_ms),
        ));
    }
    Ok(())
}

fn validate_positive(field: &'static str, value: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 || value > max {
        return Err(TollgateError::invalid(
            field,
            format!("must be greater than 0 and at most {}, got {}", max, value),
        ));
    }
    Ok(())
}

pub fn validate_burst(burst: f64) -> Result<()> {
    validate_positive("burst", burst, MAX_BURST)
}

pub fn validate_restore_rate(restore_rate: f64) -> Result<()> {
    validate_positive("restore_rate", restore_rate, MAX_RESTORE_RATE)
}

pub fn validate_concurrency(concurrency: u32) -> Result<()> {
    if concurrency == 0 || concurrency > MAX_CONCURRENCY {
        return Err(TollgateError::invalid(
            "concurrency",
            format!("must be between 1 and {}, got {}", MAX_CONCURRENCY, concurrency),
        ));
    }
    Ok(())
}

pub fn validate_key_prefix(prefix: &str) -> Result<()> {
    let len = prefix.chars().count();
    if len > MAX_KEY_PREFIX_LEN {
        return Err(TollgateError::invalid(
            "key_prefix",
            format!("must be at most {} characters, got {}", MAX_KEY_PREFIX_LEN, len),
        ));
    }
    Ok(())
}

pub fn validate_max_wait(max_wait_ms: u64) -> Result<()> {
    if max_wait_ms > MAX_WAIT_MS {
        return Err(TollgateError::invalid(
            "max_wait_ms",
            format!("must be at most {}, got {}", MAX_WAIT_MS, max_wait_ms),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_range() {
        assert!(validate_cost(0.0).is_ok());
        assert!(validate_cost(1.5).is_ok());
        assert!(validate_cost(MAX_COST).is_ok());

        assert_eq!(validate_cost(-1.0).unwrap_err().field(), Some("cost"));
        assert!(validate_cost(MAX_COST + 1.0).is_err());
        assert!(validate_cost(f64::NAN).is_err());
        assert!(validate_cost(f64::INFINITY).is_err());
    }

    #[test]
    fn test_priority_range() {
        assert!(validate_priority(0).is_ok());
        assert!(validate_priority(10).is_ok());
        assert_eq!(validate_priority(11).unwrap_err().field(), Some("priority"));
    }

    #[test]
    fn test_key_rules() {
        assert!(validate_key("store-42").is_ok());
        assert_eq!(validate_key("").unwrap_err().field(), Some("key"));
        assert!(validate_key(&"k".repeat(500)).is_ok());
        assert!(validate_key(&"k".repeat(501)).is_err());
        // length is measured in characters, not bytes
        assert!(validate_key(&"é".repeat(500)).is_ok());
    }

    #[test]
    fn test_config_ranges() {
        assert!(validate_max_requests(0).is_err());
        assert!(validate_max_requests(1).is_ok());
        assert!(validate_max_requests(MAX_REQUESTS + 1).is_err());

        assert!(validate_window_ms(0).is_err());
        assert!(validate_window_ms(MAX_WINDOW_MS).is_ok());
        assert!(validate_window_ms(MAX_WINDOW_MS + 1).is_err());

        assert!(validate_burst(0.0).is_err());
        assert!(validate_burst(0.5).is_ok());
        assert!(validate_burst(MAX_BURST * 2.0).is_err());

        assert!(validate_restore_rate(-1.0).is_err());
        assert!(validate_restore_rate(0.25).is_ok());

        assert!(validate_concurrency(0).is_err());
        assert!(validate_concurrency(MAX_CONCURRENCY).is_ok());
        assert!(validate_concurrency(MAX_CONCURRENCY + 1).is_err());

        assert!(validate_key_prefix("").is_ok());
        assert_eq!(
            validate_key_prefix(&"p".repeat(101)).unwrap_err().field(),
            Some("key_prefix")
        );

        assert!(validate_max_wait(MAX_WAIT_MS).is_ok());
        assert!(validate_max_wait(MAX_WAIT_MS + 1).is_err());
    }

    #[test]
    fn test_error_message_names_field() {
        let err = validate_window_ms(0).unwrap_err();
        assert!(err.to_string().contains("window_ms"));
    }
}
