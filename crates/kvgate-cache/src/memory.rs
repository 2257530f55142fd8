//! In-process fallback store with a live tag index.
//!
//! Entries and the tag index sit behind one mutex, and every write updates
//! both inside the same critical section, so the index never points at a
//! key whose entry disagrees about its tags. The lock is never held across
//! an `.await`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::health::HealthReport;
use crate::metrics;
use crate::pattern::glob_match;
use crate::store::{
    CounterWindow, KeyValueStore, SCAN_BATCH, ScanPage, TTL_MISSING, TTL_PERSISTENT,
    effective_ttl,
};

const BACKEND: &str = "memory";

/// Expiry instant `secs` after `now`, or `None` when the clock cannot
/// represent it.
fn deadline(now: Instant, secs: u64) -> Option<Instant> {
    now.checked_add(Duration::from_secs(secs))
}

struct MemoryEntry {
    payload: String,
    tags: HashSet<String>,
    expires_at: Option<Instant>,
    /// Creation order, kept across overwrites; scan cursors seek on it.
    seq: u64,
}

impl MemoryEntry {
    /// `None` when `ttl` is too large to turn into an expiry instant.
    fn new(
        payload: String,
        ttl: Option<u64>,
        tags: HashSet<String>,
        now: Instant,
    ) -> Option<Self> {
        let expires_at = match effective_ttl(ttl) {
            Some(secs) => Some(deadline(now, secs)?),
            None => None,
        };
        Some(Self {
            payload,
            tags,
            expires_at,
            seq: 0,
        })
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Remaining whole seconds, rounded up so a fresh 60s entry reports 60.
    fn ttl_secs(&self, now: Instant) -> i64 {
        match self.expires_at {
            None => TTL_PERSISTENT,
            Some(at) => {
                let millis = at.saturating_duration_since(now).as_millis();
                millis.div_ceil(1000) as i64
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    /// tag → keys currently carrying it
    tag_index: HashMap<String, HashSet<String>>,
    /// seq → key, for scans that stay stable while keys come and go
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl MemoryState {
    /// Look up a live entry, evicting it if it has expired.
    fn live(&mut self, key: &str, now: Instant, evictions: &AtomicU64) -> Option<&mut MemoryEntry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.remove(key);
            evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn insert(&mut self, key: &str, mut entry: MemoryEntry) {
        let (stale, seq): (Vec<String>, Option<u64>) = match self.entries.get(key) {
            Some(old) => (
                old.tags.difference(&entry.tags).cloned().collect(),
                Some(old.seq),
            ),
            None => (Vec::new(), None),
        };
        for tag in stale {
            self.unlink(&tag, key);
        }
        entry.seq = match seq {
            Some(seq) => seq,
            None => {
                self.next_seq += 1;
                self.order.insert(self.next_seq, key.to_string());
                self.next_seq
            }
        };
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.entries.insert(key.to_string(), entry);
    }

    fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        for tag in &entry.tags {
            self.unlink(tag, key);
        }
        Some(entry)
    }

    fn unlink(&mut self, tag: &str, key: &str) {
        if let Some(keys) = self.tag_index.get_mut(tag) {
            keys.remove(key);
            if keys.is_empty() {
                self.tag_index.remove(tag);
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn live_keys_matching(&self, pattern: &str, now: Instant) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Live matching keys created at or after `cursor`, in creation order.
    /// A key present for the whole walk is returned exactly once.
    fn scan_from(&self, cursor: u64, pattern: &str, count: usize, now: Instant) -> ScanPage {
        let mut keys = Vec::with_capacity(count);
        for (&seq, key) in self.order.range(cursor..) {
            if keys.len() == count {
                return ScanPage { cursor: seq, keys };
            }
            let live = self.entries.get(key).is_some_and(|e| !e.is_expired(now));
            if live && glob_match(pattern, key) {
                keys.push(key.clone());
            }
        }
        ScanPage { cursor: 0, keys }
    }
}

fn reject_ttl(key: &str, ttl: u64) {
    tracing::warn!(key = %key, ttl_secs = ttl, "TTL out of range, write rejected (memory)");
}

/// Statistics for the in-process store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Entries currently held, including expired ones not yet swept.
    pub size: usize,
    /// Distinct tags in the index.
    pub tags: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed because their TTL elapsed.
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Process-local implementation of [`KeyValueStore`].
///
/// Expired entries are evicted lazily on access and by
/// [`MemoryStore::cleanup_expired`], which the background task started with
/// [`MemoryStore::start_cleanup_task`] runs periodically.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let (removed, size) = {
            let mut state = self.state.lock();
            let removed = state.purge_expired(Instant::now());
            (removed, state.entries.len())
        };

        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        }
        metrics::set_memory_entries(size);
        removed
    }

    /// Spawn the periodic expiry sweep.
    pub fn start_cleanup_task(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tracing::info!(interval_secs = every.as_secs(), "Starting in-process cache sweep");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = self.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Evicted expired in-process cache entries");
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            size: state.entries.len(),
            tags: state.tag_index.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Keys currently indexed under `tag`.
    pub fn tagged_keys(&self, tag: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }

    fn store(&self, key: &str, payload: &str, ttl: Option<u64>, tags: &[String]) -> bool {
        let Some(entry) = MemoryEntry::new(
            payload.to_string(),
            ttl,
            tags.iter().cloned().collect(),
            Instant::now(),
        ) else {
            reject_ttl(key, ttl.unwrap_or_default());
            return false;
        };
        self.state.lock().insert(key, entry);
        true
    }

    fn increment(&self, key: &str, ttl: Option<u64>) -> Option<CounterWindow> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let window = match state.live(key, now, &self.evictions) {
            Some(entry) => {
                let Ok(current) = entry.payload.parse::<i64>() else {
                    tracing::warn!(key = %key, "INCR on a non-integer value");
                    return None;
                };
                let count = current.checked_add(1)?;
                if entry.expires_at.is_none() {
                    if let Some(secs) = effective_ttl(ttl) {
                        let Some(at) = deadline(now, secs) else {
                            reject_ttl(key, secs);
                            return None;
                        };
                        entry.expires_at = Some(at);
                    }
                }
                entry.payload = count.to_string();
                CounterWindow {
                    count,
                    ttl_secs: entry.ttl_secs(now),
                }
            }
            None => {
                let Some(entry) = MemoryEntry::new("1".to_string(), ttl, HashSet::new(), now) else {
                    reject_ttl(key, ttl.unwrap_or_default());
                    return None;
                };
                let ttl_secs = entry.ttl_secs(now);
                state.insert(key, entry);
                CounterWindow { count: 1, ttl_secs }
            }
        };

        Some(window)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn connect(&self) -> bool {
        true
    }

    async fn get_raw(&self, key: &str) -> Option<String> {
        let value = {
            let mut state = self.state.lock();
            state
                .live(key, Instant::now(), &self.evictions)
                .map(|entry| entry.payload.clone())
        };

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_hit(BACKEND);
            tracing::debug!(key = %key, "cache hit (memory)");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_miss(BACKEND);
            tracing::debug!(key = %key, "cache miss (memory)");
        }
        value
    }

    async fn set_raw(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool {
        self.store(key, payload, ttl, &[])
    }

    async fn set_with_tags(
        &self,
        key: &str,
        payload: &str,
        ttl: Option<u64>,
        tags: &[String],
    ) -> bool {
        self.store(key, payload, ttl, tags)
    }

    async fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        let keys = state.live_keys_matching(pattern, now);
        for key in &keys {
            state.remove(key);
        }
        tracing::debug!(pattern = %pattern, deleted = keys.len(), "Memory pattern delete");
        keys.len() as u64
    }

    async fn exists(&self, key: &str) -> bool {
        self.state
            .lock()
            .live(key, Instant::now(), &self.evictions)
            .is_some()
    }

    async fn expire(&self, key: &str, ttl: u64) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        if ttl == 0 {
            // Redis semantics: a non-positive expiry deletes the key.
            return state.remove(key).is_some_and(|e| !e.is_expired(now));
        }
        match state.live(key, now, &self.evictions) {
            Some(entry) => match deadline(now, ttl) {
                Some(at) => {
                    entry.expires_at = Some(at);
                    true
                }
                None => {
                    reject_ttl(key, ttl);
                    false
                }
            },
            None => false,
        }
    }

    async fn ttl(&self, key: &str) -> i64 {
        let now = Instant::now();
        self.state
            .lock()
            .live(key, now, &self.evictions)
            .map_or(TTL_MISSING, |entry| entry.ttl_secs(now))
    }

    async fn mget(&self, keys: &[String]) -> Vec<Option<String>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        keys.iter()
            .map(|key| {
                state
                    .live(key, now, &self.evictions)
                    .map(|entry| entry.payload.clone())
            })
            .collect()
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> ScanPage {
        let count = if count == 0 { SCAN_BATCH } else { count };
        self.state
            .lock()
            .scan_from(cursor, pattern, count, Instant::now())
    }

    async fn incr(&self, key: &str) -> Option<i64> {
        self.increment(key, None).map(|window| window.count)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: u64) -> Option<CounterWindow> {
        self.increment(key, Some(ttl))
    }

    async fn set_nx(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool {
        let now = Instant::now();
        let Some(entry) = MemoryEntry::new(payload.to_string(), ttl, HashSet::new(), now) else {
            reject_ttl(key, ttl.unwrap_or_default());
            return false;
        };
        let mut state = self.state.lock();
        if state.live(key, now, &self.evictions).is_some() {
            return false;
        }
        state.insert(key, entry);
        true
    }

    async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        let removed = keys
            .iter()
            .filter_map(|key| state.remove(key))
            .filter(|entry| !entry.is_expired(now))
            .count() as u64;

        tracing::debug!(tag = %tag, removed, "Invalidated tag (memory)");
        removed
    }

    async fn flush(&self) -> bool {
        let mut state = self.state.lock();
        state.entries.clear();
        state.tag_index.clear();
        state.order.clear();
        true
    }

    async fn health_check(&self) -> HealthReport {
        HealthReport::healthy(BACKEND, 0)
    }
}
