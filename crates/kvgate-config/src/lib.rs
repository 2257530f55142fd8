//! Runtime configuration primitives shared by the kvgate crates.
//!
//! The caching core consults feature flags on every call instead of caching
//! a decision at construction time, so flag state lives behind a lock-free
//! handle that can be swapped while requests are in flight:
//!
//! ```text
//! SharedFeatureFlags ──load()──► Arc<FeatureFlags> ──is_enabled()──► bool
//!         ▲
//!         └── replace() / upsert()  (admin reload, tests)
//! ```

pub mod feature_flags;
pub mod shared;

pub use feature_flags::{FeatureContext, FeatureFlag, FeatureFlagType, FeatureFlags, flag_names};
pub use shared::SharedFeatureFlags;

/// Error types for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
