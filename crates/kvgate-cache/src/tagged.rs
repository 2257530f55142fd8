//! Tag-aware cache on top of any [`KeyValueStore`].
//!
//! Values are stored as `{"value": .., "tags": [..]}`. Invalidation:
//!
//! - by key: direct delete
//! - by pattern: cursor scan + bulk delete
//! - by tag: exact on the in-process store (live tag index); a no-op on the
//!   remote store, where tags are unindexed metadata. Remote callers that
//!   need bulk invalidation must put the grouping into the key
//!   (`cache:bounty:*`) and invalidate by pattern.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::BackendSelector;
use crate::store::{KeyValueStore, decode_value, encode};

/// Stored form of a tagged value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
    pub value: T,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// An object carrying `value` and nothing but `tags` besides it.
fn is_envelope(raw: &serde_json::Value) -> bool {
    raw.as_object().is_some_and(|fields| {
        fields.contains_key("value") && fields.keys().all(|k| k == "value" || k == "tags")
    })
}

/// `{key, ttl, tags}` triple a domain helper uses for one kind of read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub key: String,
    pub ttl_seconds: u64,
    pub tags: Vec<String>,
}

impl CachePolicy {
    pub fn new(key: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            key: key.into(),
            ttl_seconds,
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    fn tag_refs(&self) -> Vec<&str> {
        self.tags.iter().map(String::as_str).collect()
    }
}

/// Tagged cache over a shared store.
pub struct TaggedCache<S = BackendSelector> {
    store: Arc<S>,
}

impl<S> Clone for TaggedCache<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore> TaggedCache<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Store `value` with `tags`. Duplicate tags are collapsed.
    pub async fn set<T>(&self, key: &str, value: &T, ttl: Option<u64>, tags: &[&str]) -> bool
    where
        T: Serialize + Sync,
    {
        let tags = dedup_tags(tags);
        let envelope = CacheEnvelope {
            value,
            tags: tags.clone(),
        };
        match encode(key, &envelope) {
            Some(payload) => self.store.set_with_tags(key, &payload, ttl, &tags).await,
            None => false,
        }
    }

    /// The cached value without its tags. Values written without an
    /// envelope are returned as-is; an envelope whose value does not decode
    /// as `T` is a miss.
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        let raw: serde_json::Value = self.store.get(key).await?;
        if is_envelope(&raw) {
            decode_value::<CacheEnvelope<T>>(key, raw).map(|envelope| envelope.value)
        } else {
            decode_value(key, raw)
        }
    }

    /// The cached value together with its tags.
    pub async fn get_entry<T>(&self, key: &str) -> Option<CacheEnvelope<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.store.get::<CacheEnvelope<T>>(key).await
    }

    /// Return the cached value, or run `fetcher` once and cache its result.
    ///
    /// There is no single-flight: two callers that miss at the same time
    /// both run their fetcher, and the later write wins.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<u64>,
        tags: &[&str],
        fetcher: F,
    ) -> T
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return cached;
        }
        let value = fetcher().await;
        self.set(key, &value, ttl, tags).await;
        value
    }

    /// Like [`get_or_set`](Self::get_or_set) with a fallible fetcher. Errors
    /// are returned to the caller and nothing is cached.
    pub async fn try_get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<u64>,
        tags: &[&str],
        fetcher: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return Ok(cached);
        }
        let value = fetcher().await?;
        self.set(key, &value, ttl, tags).await;
        Ok(value)
    }

    pub async fn remember<T, F, Fut>(&self, policy: &CachePolicy, fetcher: F) -> T
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.get_or_set(
            &policy.key,
            Some(policy.ttl_seconds),
            &policy.tag_refs(),
            fetcher,
        )
        .await
    }

    pub async fn store_with_policy<T>(&self, policy: &CachePolicy, value: &T) -> bool
    where
        T: Serialize + Sync,
    {
        self.set(&policy.key, value, Some(policy.ttl_seconds), &policy.tag_refs())
            .await
    }

    /// Drop the policy's key and everything sharing its tags.
    pub async fn forget(&self, policy: &CachePolicy) -> u64 {
        let mut removed = u64::from(self.invalidate(&policy.key).await);
        for tag in &policy.tags {
            removed += self.invalidate_tag(tag).await;
        }
        removed
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.store.delete(key).await
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        self.store.delete_by_pattern(pattern).await
    }

    /// Exact on the in-process store, `0` on the remote store.
    pub async fn invalidate_tag(&self, tag: &str) -> u64 {
        self.store.invalidate_by_tag(tag).await
    }
}

fn dedup_tags(tags: &[&str]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        if !unique.iter().any(|t| t == tag) {
            unique.push((*tag).to_string());
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::block_on;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Bounty {
        id: u64,
        title: String,
    }

    fn cache() -> TaggedCache<MemoryStore> {
        TaggedCache::new(Arc::new(MemoryStore::new()))
    }

    fn bounty(id: u64) -> Bounty {
        Bounty {
            id,
            title: format!("bounty {id}"),
        }
    }

    #[tokio::test]
    async fn test_set_get_unwraps_value() {
        let cache = cache();
        assert!(cache.set("cache:bounty:1", &bounty(1), Some(60), &["bounties"]).await);
        assert_eq!(cache.get::<Bounty>("cache:bounty:1").await, Some(bounty(1)));

        let entry = cache.get_entry::<Bounty>("cache:bounty:1").await.unwrap();
        assert_eq!(entry.tags, vec!["bounties".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_tags_collapse() {
        let cache = cache();
        cache.set("k", &1, None, &["a", "b", "a"]).await;
        let entry = cache.get_entry::<i32>("k").await.unwrap();
        assert_eq!(entry.tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_get_reads_raw_writes() {
        let cache = cache();
        cache.store().set("plain", &42, None).await;
        assert_eq!(cache.get::<i32>("plain").await, Some(42));
    }

    #[tokio::test]
    async fn test_envelope_with_wrong_value_type_is_miss() {
        type Fields = std::collections::HashMap<String, serde_json::Value>;

        let cache = cache();
        cache.set("k", &"text", None, &["t"]).await;
        assert_eq!(cache.get::<i32>("k").await, None);
        assert_eq!(cache.get::<Fields>("k").await, None);

        // Plain objects that only resemble an envelope are still bare values.
        let plain = serde_json::json!({ "value": 1, "owner": "ops" });
        cache.store().set("plain", &plain, None).await;
        let fields = cache.get::<Fields>("plain").await.unwrap();
        assert_eq!(fields.get("owner"), Some(&serde_json::json!("ops")));
    }

    #[tokio::test]
    async fn test_get_or_set_fetches_once() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let value = cache
                .get_or_set("cache:bounty:7", Some(60), &["bounties"], || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    bounty(7)
                })
                .await;
            assert_eq!(value, bounty(7));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_try_get_or_set_does_not_cache_errors() {
        let cache = cache();

        let failed: Result<Bounty, &str> = cache
            .try_get_or_set("cache:bounty:8", Some(60), &[], || async { Err("db down") })
            .await;
        assert_eq!(failed, Err("db down"));
        assert!(!cache.store().exists("cache:bounty:8").await);

        let ok: Result<Bounty, &str> = cache
            .try_get_or_set("cache:bounty:8", Some(60), &[], || async { Ok(bounty(8)) })
            .await;
        assert_eq!(ok, Ok(bounty(8)));
        assert!(cache.store().exists("cache:bounty:8").await);
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let cache = cache();
        cache.set("user:1", &"a", None, &["users"]).await;
        cache.set("user:2", &"b", None, &["users"]).await;
        cache.set("user:3", &"c", None, &[]).await;

        assert_eq!(cache.invalidate_tag("users").await, 2);
        assert_eq!(cache.get::<String>("user:1").await, None);
        assert_eq!(cache.get::<String>("user:2").await, None);
        assert_eq!(cache.get::<String>("user:3").await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let cache = cache();
        cache.set("user:1", &1, None, &[]).await;
        cache.set("user:2", &2, None, &[]).await;
        cache.set("product:1", &3, None, &[]).await;

        assert_eq!(cache.invalidate_pattern("user:*").await, 2);
        assert_eq!(cache.get::<i32>("product:1").await, Some(3));
    }

    #[tokio::test]
    async fn test_policy_helpers() {
        let cache = cache();
        let policy = CachePolicy::new("cache:leaderboard", 300).tag("leaderboard");
        let related = CachePolicy::new("cache:leaderboard:weekly", 300).tag("leaderboard");

        let top: Vec<u64> = cache.remember(&policy, || async { vec![3, 1, 2] }).await;
        assert_eq!(top, vec![3, 1, 2]);
        assert!(cache.store_with_policy(&related, &vec![9u64]).await);
        assert!((1..=300).contains(&cache.store().ttl("cache:leaderboard").await));

        // Key delete removes one entry; the tag sweep picks up the other.
        assert_eq!(cache.forget(&policy).await, 2);
        assert_eq!(cache.get::<Vec<u64>>("cache:leaderboard:weekly").await, None);
    }

    #[test]
    fn test_policy_tags_reach_the_index() {
        let policy = CachePolicy::new("cache:bounty:3", 60)
            .tag("bounties")
            .tag("bounty:3");
        let cache = cache();

        block_on(async {
            assert!(cache.store_with_policy(&policy, &bounty(3)).await);
        });
        assert_eq!(cache.store().tagged_keys("bounty:3"), vec!["cache:bounty:3".to_string()]);
        assert_eq!(cache.store().tagged_keys("bounties"), vec!["cache:bounty:3".to_string()]);
    }
}
