//! Per-call routing between the remote store and the in-process fallback.
//!
//! ## Routing
//!
//! | `cache.remote.enabled` | remote configured | fallback enabled | backend    |
//! |------------------------|-------------------|------------------|------------|
//! | on                     | yes               | any              | `Remote`   |
//! | off                    | any               | yes              | `Fallback` |
//! | any                    | no                | yes              | `Fallback` |
//! | otherwise              |                   | no               | `Disabled` |
//!
//! The decision is re-made on every call because the flag can change per
//! request and per identity. `Disabled` answers exactly like a remote store
//! with no configuration, so callers cannot tell "disabled",
//! "misconfigured" and "temporarily down" apart.

use std::sync::Arc;

use async_trait::async_trait;
use kvgate_config::{SharedFeatureFlags, flag_names};
use serde::Serialize;

use crate::config::{FallbackConfig, RemoteConfig};
use crate::health::HealthReport;
use crate::memory::MemoryStore;
use crate::remote::RemoteStore;
use crate::store::{CounterWindow, KeyValueStore, ScanPage};

/// Which backend a call was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Remote,
    Fallback,
    Disabled,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Remote => "remote",
            BackendKind::Fallback => "fallback",
            BackendKind::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing decision as a pure function of flag state and configuration.
pub fn route(remote_enabled: bool, remote_configured: bool, has_fallback: bool) -> BackendKind {
    if remote_enabled && remote_configured {
        BackendKind::Remote
    } else if has_fallback {
        BackendKind::Fallback
    } else {
        BackendKind::Disabled
    }
}

/// The store chosen for one call.
#[derive(Clone, Copy)]
pub enum Backend<'a> {
    Remote(&'a RemoteStore),
    Fallback(&'a MemoryStore),
    /// An unconfigured remote store: every call returns its default.
    Disabled(&'a RemoteStore),
}

macro_rules! dispatch {
    ($backend:expr, $store:ident => $call:expr) => {
        match $backend {
            Backend::Remote($store) | Backend::Disabled($store) => $call,
            Backend::Fallback($store) => $call,
        }
    };
}

impl Backend<'_> {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Remote(_) => BackendKind::Remote,
            Backend::Fallback(_) => BackendKind::Fallback,
            Backend::Disabled(_) => BackendKind::Disabled,
        }
    }
}

#[async_trait]
impl<'a> KeyValueStore for Backend<'a> {
    fn backend_name(&self) -> &'static str {
        match self {
            Backend::Disabled(_) => "disabled",
            other => dispatch!(other, store => store.backend_name()),
        }
    }

    fn is_available(&self) -> bool {
        dispatch!(self, store => store.is_available())
    }

    async fn connect(&self) -> bool {
        dispatch!(self, store => store.connect().await)
    }

    async fn get_raw(&self, key: &str) -> Option<String> {
        dispatch!(self, store => store.get_raw(key).await)
    }

    async fn set_raw(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool {
        dispatch!(self, store => store.set_raw(key, payload, ttl).await)
    }

    async fn set_with_tags(
        &self,
        key: &str,
        payload: &str,
        ttl: Option<u64>,
        tags: &[String],
    ) -> bool {
        dispatch!(self, store => store.set_with_tags(key, payload, ttl, tags).await)
    }

    async fn delete(&self, key: &str) -> bool {
        dispatch!(self, store => store.delete(key).await)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        dispatch!(self, store => store.delete_by_pattern(pattern).await)
    }

    async fn exists(&self, key: &str) -> bool {
        dispatch!(self, store => store.exists(key).await)
    }

    async fn expire(&self, key: &str, ttl: u64) -> bool {
        dispatch!(self, store => store.expire(key, ttl).await)
    }

    async fn ttl(&self, key: &str) -> i64 {
        dispatch!(self, store => store.ttl(key).await)
    }

    async fn mget(&self, keys: &[String]) -> Vec<Option<String>> {
        dispatch!(self, store => store.mget(keys).await)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> ScanPage {
        dispatch!(self, store => store.scan(cursor, pattern, count).await)
    }

    async fn incr(&self, key: &str) -> Option<i64> {
        dispatch!(self, store => store.incr(key).await)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: u64) -> Option<CounterWindow> {
        dispatch!(self, store => store.incr_with_expiry(key, ttl).await)
    }

    async fn set_nx(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool {
        dispatch!(self, store => store.set_nx(key, payload, ttl).await)
    }

    async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        dispatch!(self, store => store.invalidate_by_tag(tag).await)
    }

    async fn flush(&self) -> bool {
        dispatch!(self, store => store.flush().await)
    }

    async fn health_check(&self) -> HealthReport {
        let mut report = dispatch!(self, store => store.health_check().await);
        report.backend = self.backend_name();
        report
    }
}

/// Chooses a [`Backend`] for every call.
pub struct BackendSelector {
    remote: RemoteStore,
    fallback: Option<Arc<MemoryStore>>,
    disabled: RemoteStore,
    flags: SharedFeatureFlags,
}

impl BackendSelector {
    pub fn new(remote: &RemoteConfig, fallback: &FallbackConfig, flags: SharedFeatureFlags) -> Self {
        let fallback = fallback.enabled.then(|| Arc::new(MemoryStore::new()));
        Self::with_stores(RemoteStore::new(remote), fallback, flags)
    }

    /// Build from pre-constructed stores.
    pub fn with_stores(
        remote: RemoteStore,
        fallback: Option<Arc<MemoryStore>>,
        flags: SharedFeatureFlags,
    ) -> Self {
        Self {
            remote,
            fallback,
            disabled: RemoteStore::unconfigured(),
            flags,
        }
    }

    /// Which backend serves `identity` right now.
    pub fn mode(&self, identity: Option<&str>) -> BackendKind {
        route(
            self.flags.is_enabled_for(flag_names::REMOTE_CACHE, identity),
            self.remote.is_available(),
            self.fallback.is_some(),
        )
    }

    pub fn select(&self, identity: Option<&str>) -> Backend<'_> {
        let kind = self.mode(identity);
        tracing::trace!(backend = %kind, identity = ?identity, "Selected cache backend");
        match (kind, self.fallback.as_deref()) {
            (BackendKind::Remote, _) => Backend::Remote(&self.remote),
            (BackendKind::Fallback, Some(memory)) => Backend::Fallback(memory),
            _ => Backend::Disabled(&self.disabled),
        }
    }

    pub fn remote(&self) -> &RemoteStore {
        &self.remote
    }

    pub fn fallback(&self) -> Option<&Arc<MemoryStore>> {
        self.fallback.as_ref()
    }

    pub fn flags(&self) -> &SharedFeatureFlags {
        &self.flags
    }
}

/// Anonymous calls: routed with no identity, re-selected per call.
#[async_trait]
impl KeyValueStore for BackendSelector {
    fn backend_name(&self) -> &'static str {
        self.select(None).backend_name()
    }

    fn is_available(&self) -> bool {
        self.select(None).is_available()
    }

    async fn connect(&self) -> bool {
        self.select(None).connect().await
    }

    async fn get_raw(&self, key: &str) -> Option<String> {
        self.select(None).get_raw(key).await
    }

    async fn set_raw(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool {
        self.select(None).set_raw(key, payload, ttl).await
    }

    async fn set_with_tags(
        &self,
        key: &str,
        payload: &str,
        ttl: Option<u64>,
        tags: &[String],
    ) -> bool {
        self.select(None).set_with_tags(key, payload, ttl, tags).await
    }

    async fn delete(&self, key: &str) -> bool {
        self.select(None).delete(key).await
    }

    async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        self.select(None).delete_by_pattern(pattern).await
    }

    async fn exists(&self, key: &str) -> bool {
        self.select(None).exists(key).await
    }

    async fn expire(&self, key: &str, ttl: u64) -> bool {
        self.select(None).expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> i64 {
        self.select(None).ttl(key).await
    }

    async fn mget(&self, keys: &[String]) -> Vec<Option<String>> {
        self.select(None).mget(keys).await
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> ScanPage {
        self.select(None).scan(cursor, pattern, count).await
    }

    async fn incr(&self, key: &str) -> Option<i64> {
        self.select(None).incr(key).await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: u64) -> Option<CounterWindow> {
        self.select(None).incr_with_expiry(key, ttl).await
    }

    async fn set_nx(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool {
        self.select(None).set_nx(key, payload, ttl).await
    }

    async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        self.select(None).invalidate_by_tag(tag).await
    }

    async fn flush(&self) -> bool {
        self.select(None).flush().await
    }

    async fn health_check(&self) -> HealthReport {
        self.select(None).health_check().await
    }
}
