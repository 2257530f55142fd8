//! Fixed-window rate limiting.
//!
//! Counts live under `{prefix}:{identity}:{route}` in whatever backend the
//! selector picks for the identity. When that backend cannot count (remote
//! disabled, unconfigured or failing) the same key is counted in a
//! process-local window instead, so a request is never let through just
//! because the store is down.
//!
//! A window is created by the first request, expires `window_secs` later and
//! is then replaced wholesale: the next request starts again at 1.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;

use crate::backend::BackendSelector;
use crate::config::{MAX_WINDOW_SECS, RateLimitConfig};
use crate::metrics;
use crate::store::{CounterWindow, KeyValueStore};

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Window state attached to an allowed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// Window end as unix epoch milliseconds.
    pub reset_at_ms: u64,
}

impl RateLimitInfo {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at_ms.to_string()),
        ]
    }
}

/// The request is over its window's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit of {} exceeded, retry after {retry_after_secs}s", .info.limit)]
pub struct RateLimitExceeded {
    pub info: RateLimitInfo,
    /// Seconds until the window resets, between 1 and the window length.
    pub retry_after_secs: u64,
}

impl RateLimitExceeded {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = self.info.headers();
        headers.push((HEADER_RETRY_AFTER, self.retry_after_secs.to_string()));
        headers
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: i64,
    reset_at: Instant,
}

/// Per-identity, per-route request limiter.
#[derive(Clone)]
pub struct RateLimiter {
    selector: Arc<BackendSelector>,
    config: RateLimitConfig,
    local: Arc<DashMap<String, LocalWindow>>,
}

impl RateLimiter {
    pub fn new(selector: Arc<BackendSelector>, config: RateLimitConfig) -> Self {
        Self {
            selector,
            config,
            local: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn key(&self, identity: &str, route: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, identity, route)
    }

    /// Count one request for `identity` on `route`.
    pub async fn check(
        &self,
        identity: &str,
        route: &str,
    ) -> Result<RateLimitInfo, RateLimitExceeded> {
        let key = self.key(identity, route);
        let window_secs = self.config.window_secs;

        let counter = match self
            .selector
            .select(Some(identity))
            .incr_with_expiry(&key, window_secs)
            .await
        {
            Some(counter) => counter,
            None => {
                tracing::debug!(key = %key, "Counting request in process-local window");
                metrics::record_rate_limit_local_fallback();
                self.local_increment(&key)
            }
        };

        let limit = self.config.max_requests;
        let count = u64::try_from(counter.count).unwrap_or(0);
        let reset_in = window_remaining(counter.ttl_secs, window_secs);
        let info = RateLimitInfo {
            limit,
            remaining: limit.saturating_sub(count),
            reset_at_ms: now_epoch_ms().saturating_add(reset_in.saturating_mul(1000)),
        };

        if count > limit {
            metrics::record_rate_limit_rejection();
            tracing::debug!(
                identity = %identity,
                route = %route,
                count,
                limit,
                "Rate limit exceeded"
            );
            return Err(RateLimitExceeded {
                info,
                retry_after_secs: reset_in.clamp(1, window_secs.max(1)),
            });
        }

        Ok(info)
    }

    /// Drop the window for `identity` on `route` in both places it may live.
    pub async fn reset(&self, identity: &str, route: &str) -> bool {
        let key = self.key(identity, route);
        let local = self.local.remove(&key).is_some();
        let stored = self.selector.select(Some(identity)).delete(&key).await;
        local || stored
    }

    /// Remove expired process-local windows. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, window| window.reset_at > now);
        before.saturating_sub(self.local.len())
    }

    pub fn start_cleanup_task(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tracing::info!(interval_secs = every.as_secs(), "Starting rate-limit window sweep");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = limiter.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Dropped expired rate-limit windows");
                }
            }
        })
    }

    /// Windows currently counted in process.
    pub fn local_window_count(&self) -> usize {
        self.local.len()
    }

    fn local_increment(&self, key: &str) -> CounterWindow {
        let now = Instant::now();
        let length = Duration::from_secs(self.config.window_secs.min(MAX_WINDOW_SECS));

        let mut window = self
            .local
            .entry(key.to_string())
            .or_insert_with(|| LocalWindow {
                count: 0,
                reset_at: now + length,
            });
        if window.reset_at <= now {
            *window = LocalWindow {
                count: 0,
                reset_at: now + length,
            };
        }
        window.count += 1;

        let left = window.reset_at.saturating_duration_since(now);
        CounterWindow {
            count: window.count,
            ttl_secs: i64::try_from(left.as_millis().div_ceil(1000)).unwrap_or(i64::MAX),
        }
    }
}

/// Seconds left in the window. A counter without an expiry is treated as a
/// fresh window.
fn window_remaining(ttl_secs: i64, window_secs: u64) -> u64 {
    match u64::try_from(ttl_secs) {
        Ok(secs) => secs.min(window_secs),
        Err(_) => window_secs,
    }
}

fn now_epoch_ms() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}
