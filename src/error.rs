//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Capacity outcomes (rejections, wait timeouts) are never errors; they are
/// reported through [`crate::ratelimit::RateLimitResult`] and `bool` returns.
/// Storage failures are logged and absorbed by the limiter, so they never
/// surface here.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// A caller-supplied argument was out of range
    #[error("Invalid argument `{field}`: {message}")]
    InvalidArgument {
        /// Name of the offending field
        field: &'static str,
        /// What was wrong with it
        message: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        TollgateError::InvalidArgument {
            field,
            message: message.into(),
        }
    }

    /// The offending field, if this is an invalid-argument error.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            TollgateError::InvalidArgument { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
