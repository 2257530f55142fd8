//! The key-value contract shared by every backend.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CacheError;
use crate::health::HealthReport;

/// `ttl()` result for a key that does not exist.
pub const TTL_MISSING: i64 = -2;
/// `ttl()` result for a key that exists without an expiry.
pub const TTL_PERSISTENT: i64 = -1;

/// Keys requested per SCAN round trip.
pub const SCAN_BATCH: usize = 100;

/// One page of a cursor-based scan. A cursor of `0` means the scan is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Counter state after an atomic increment-with-expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterWindow {
    /// Value after the increment.
    pub count: i64,
    /// Seconds until the counter expires, or [`TTL_PERSISTENT`].
    pub ttl_secs: i64,
}

/// Key-value store with expiry, counters and cursor scans.
///
/// Every method is infallible at this boundary. Backend failures are logged
/// and reported as the documented default: a miss for reads, `false` or `0`
/// for writes, [`TTL_MISSING`] for `ttl`. Callers must stay correct when the
/// store silently does nothing.
///
/// Payloads are JSON documents; the typed helpers (`get`, `set`,
/// `mget_typed`) handle encoding.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Short name used in logs, metrics and health reports.
    fn backend_name(&self) -> &'static str;

    /// Whether this store has what it needs to serve requests.
    fn is_available(&self) -> bool;

    /// Best-effort liveness probe.
    async fn connect(&self) -> bool;

    async fn get_raw(&self, key: &str) -> Option<String>;

    async fn set_raw(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool;

    /// Store `payload` and record its tags. Backends without a tag index
    /// keep the tags only inside the payload.
    async fn set_with_tags(
        &self,
        key: &str,
        payload: &str,
        ttl: Option<u64>,
        tags: &[String],
    ) -> bool;

    /// Returns `true` when a key was removed.
    async fn delete(&self, key: &str) -> bool;

    /// Delete every key matching a glob pattern, returning the count removed.
    async fn delete_by_pattern(&self, pattern: &str) -> u64;

    async fn exists(&self, key: &str) -> bool;

    async fn expire(&self, key: &str, ttl: u64) -> bool;

    /// Remaining seconds, [`TTL_PERSISTENT`] or [`TTL_MISSING`].
    async fn ttl(&self, key: &str) -> i64;

    /// Values aligned with `keys`, `None` for misses.
    async fn mget(&self, keys: &[String]) -> Vec<Option<String>>;

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> ScanPage;

    /// Increment, creating the key at 1 if absent. `None` when unavailable.
    async fn incr(&self, key: &str) -> Option<i64>;

    /// Increment and set the expiry if the key has none, as one atomic step.
    async fn incr_with_expiry(&self, key: &str, ttl: u64) -> Option<CounterWindow>;

    /// Create `key` only if it does not exist. `false` on contention.
    async fn set_nx(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool;

    /// Delete every key carrying `tag`, returning the count removed.
    async fn invalidate_by_tag(&self, tag: &str) -> u64;

    /// Drop every key in the store.
    async fn flush(&self) -> bool;

    async fn health_check(&self) -> HealthReport;

    async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        let payload = self.get_raw(key).await?;
        decode(key, &payload)
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool
    where
        T: Serialize + Sync,
    {
        match encode(key, value) {
            Some(payload) => self.set_raw(key, &payload, ttl).await,
            None => false,
        }
    }

    async fn mget_typed<T>(&self, keys: &[String]) -> Vec<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.mget(keys)
            .await
            .into_iter()
            .zip(keys)
            .map(|(payload, key)| payload.and_then(|p| decode(key, &p)))
            .collect()
    }

    /// Walk a full scan and return each matching key once.
    ///
    /// Keys created or deleted mid-scan may or may not show up. The walk
    /// stops when the cursor returns to `0`.
    async fn scan_keys(&self, pattern: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut cursor = 0;

        loop {
            let page = self.scan(cursor, pattern, SCAN_BATCH).await;
            for key in page.keys {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        keys
    }
}

/// Decode a payload, treating undecodable data as a miss.
pub(crate) fn decode<T: DeserializeOwned>(key: &str, payload: &str) -> Option<T> {
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            let err = CacheError::malformed(key, e.to_string());
            tracing::warn!(key = %key, error = %err, "Discarding undecodable cache entry");
            None
        }
    }
}

pub(crate) fn decode_value<T: DeserializeOwned>(key: &str, raw: serde_json::Value) -> Option<T> {
    match serde_json::from_value(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            let err = CacheError::malformed(key, e.to_string());
            tracing::warn!(key = %key, error = %err, "Discarding cache entry of unexpected shape");
            None
        }
    }
}

pub(crate) fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to encode cache value");
            None
        }
    }
}

/// A TTL of zero means "no expiry".
pub(crate) fn effective_ttl(ttl: Option<u64>) -> Option<u64> {
    ttl.filter(|secs| *secs > 0)
}
