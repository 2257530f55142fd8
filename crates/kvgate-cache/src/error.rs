//! Error types for the caching core.
//!
//! Nothing in this module crosses the [`KeyValueStore`](crate::KeyValueStore)
//! boundary: store implementations map every [`CacheError`] to the documented
//! miss/false/no-op default and log it. The only error application code sees
//! is [`RateLimitExceeded`](crate::rate_limit::RateLimitExceeded).

/// Failures inside a store implementation.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No endpoint URL or token configured. Permanent until reconfigured.
    #[error("remote cache is not configured")]
    ConfigurationAbsent,

    /// Network failure talking to the remote service.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// The request did not complete within the configured timeout.
    #[error("remote cache timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured request timeout.
        timeout_ms: u64,
    },

    /// The service answered with an error status or an `{"error": ..}` body.
    #[error("backend error: {message}")]
    Backend {
        /// Error reported by the service.
        message: String,
    },

    /// A payload was present but could not be decoded.
    #[error("malformed entry at {key}: {message}")]
    MalformedEntry {
        /// Key holding the payload.
        key: String,
        /// Decoder error.
        message: String,
    },
}

impl CacheError {
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn malformed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedEntry {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Result alias used inside store implementations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = CacheError::malformed("cache:bounty:1", "expected value");
        assert_eq!(
            err.to_string(),
            "malformed entry at cache:bounty:1: expected value"
        );
    }
}
