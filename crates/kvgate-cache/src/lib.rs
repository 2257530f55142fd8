//! Caching, rate limiting and session storage over a remote KV service.
//!
//! ## Backends
//!
//! - **Remote**: REST KV service shared by every instance ([`RemoteStore`])
//! - **Fallback**: in-process store with TTLs and a tag index ([`MemoryStore`])
//! - **Disabled**: every call returns the unavailable defaults
//!
//! The [`BackendSelector`] picks one of them on every call from the
//! `cache.remote.enabled` flag and the remote configuration:
//!
//! ```text
//! flag on + remote configured → Remote
//! otherwise, fallback enabled → Fallback
//! otherwise                   → Disabled
//! ```
//!
//! ## Graceful Degradation
//!
//! No operation on the store boundary returns an error. Remote failures are
//! logged and counted, and the caller sees a miss, `false`, `0` or
//! [`store::TTL_MISSING`]. The only error a request can see is
//! [`RateLimitExceeded`].
//!
//! [`CacheContext`] wires everything together from [`CacheSettings`].

pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod pattern;
pub mod rate_limit;
pub mod remote;
pub mod session;
pub mod store;
pub mod tagged;

use std::sync::Arc;
use std::time::Duration;

use kvgate_config::{FeatureFlags, SharedFeatureFlags};

pub use backend::{Backend, BackendKind, BackendSelector};
pub use config::{
    CacheSettings, FallbackConfig, RateLimitConfig, RemoteConfig, SessionConfig, SettingsError,
};
pub use error::{CacheError, CacheResult};
pub use health::{Diagnostics, HealthReport};
pub use memory::{CacheStats, MemoryStore};
pub use rate_limit::{RateLimitExceeded, RateLimitInfo, RateLimiter};
pub use remote::RemoteStore;
pub use session::{SessionCookie, SessionPayload, SessionRecord, SessionStore};
pub use store::{CounterWindow, KeyValueStore, ScanPage};
pub use tagged::{CacheEnvelope, CachePolicy, TaggedCache};

/// Everything a process needs for caching, built once at startup and shared.
pub struct CacheContext {
    settings: CacheSettings,
    selector: Arc<BackendSelector>,
    cache: TaggedCache,
    rate_limiter: RateLimiter,
    sessions: SessionStore,
}

impl CacheContext {
    /// Build a context whose routing follows `flags`. Flag changes made
    /// through the handle apply to the next call.
    pub fn new(settings: CacheSettings, flags: SharedFeatureFlags) -> Self {
        let selector = Arc::new(BackendSelector::new(
            &settings.remote,
            &settings.fallback,
            flags,
        ));
        Self::with_selector(settings, selector)
    }

    /// Build a context with flags taken from the settings, on top of the
    /// built-in defaults.
    pub fn from_settings(settings: CacheSettings) -> Self {
        let mut flags = FeatureFlags::with_defaults();
        flags.merge(settings.flags.clone());
        Self::new(settings, SharedFeatureFlags::new(flags))
    }

    pub fn with_selector(settings: CacheSettings, selector: Arc<BackendSelector>) -> Self {
        let cache = TaggedCache::new(Arc::clone(&selector));
        let rate_limiter = RateLimiter::new(Arc::clone(&selector), settings.rate_limit.clone());
        let sessions = SessionStore::new(Arc::clone(&selector), settings.session.clone());

        tracing::info!(
            mode = %selector.mode(None),
            remote_configured = selector.remote().is_available(),
            fallback = selector.fallback().is_some(),
            "Cache context initialized"
        );

        Self {
            settings,
            selector,
            cache,
            rate_limiter,
            sessions,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn selector(&self) -> &Arc<BackendSelector> {
        &self.selector
    }

    pub fn flags(&self) -> &SharedFeatureFlags {
        self.selector.flags()
    }

    pub fn cache(&self) -> &TaggedCache {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Spawn the fallback store sweep (when present) and the rate-limit
    /// window sweep.
    pub fn start_maintenance(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);
        if let Some(memory) = self.selector.fallback() {
            let every = Duration::from_secs(self.settings.fallback.cleanup_interval_secs);
            handles.push(Arc::clone(memory).start_cleanup_task(every));
        }
        let every = Duration::from_secs(self.settings.rate_limit.cleanup_interval_secs);
        handles.push(self.rate_limiter.start_cleanup_task(every));
        handles
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            mode: self.selector.mode(None),
            remote_configured: self.selector.remote().is_available(),
            health: self.selector.health_check().await,
            fallback: self.selector.fallback().map(|memory| memory.stats()),
            local_rate_windows: self.rate_limiter.local_window_count(),
        }
    }
}
