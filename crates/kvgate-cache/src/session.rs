//! Server-side session persistence.
//!
//! Sessions are stored as JSON under `prefix + sid` with no tags. The TTL
//! comes from the session's own max-age when it declares one, otherwise from
//! [`SessionConfig::default_ttl_secs`]. Enumeration (`all`, `length`,
//! `clear`) only ever walks cursor scans.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::BackendSelector;
use crate::config::SessionConfig;
use crate::store::KeyValueStore;

/// A value that can be stored as a session.
pub trait SessionPayload: Serialize + DeserializeOwned + Send + Sync {
    /// Lifetime declared by the session itself.
    fn max_age(&self) -> Option<Duration> {
        None
    }
}

/// Cookie metadata carried inside a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    /// Milliseconds; `None` for a browser-session cookie.
    #[serde(rename = "maxAge", default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
}

/// Default session shape: cookie metadata plus free-form data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub cookie: SessionCookie,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl SessionRecord {
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            cookie: SessionCookie {
                max_age_ms: Some(u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX)),
                ..SessionCookie::default()
            },
            data: serde_json::Map::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }
}

impl SessionPayload for SessionRecord {
    fn max_age(&self) -> Option<Duration> {
        self.cookie.max_age_ms.map(Duration::from_millis)
    }
}

impl SessionPayload for serde_json::Value {
    fn max_age(&self) -> Option<Duration> {
        self.pointer("/cookie/maxAge")
            .and_then(serde_json::Value::as_u64)
            .map(Duration::from_millis)
    }
}

/// Session store over a shared key-value store.
pub struct SessionStore<S = BackendSelector> {
    store: Arc<S>,
    config: SessionConfig,
}

impl<S> Clone for SessionStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: KeyValueStore> SessionStore<S> {
    pub fn new(store: Arc<S>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn key(&self, sid: &str) -> String {
        format!("{}{}", self.config.prefix, sid)
    }

    pub async fn get<P>(&self, sid: &str) -> Option<P>
    where
        P: SessionPayload,
    {
        self.store.get(&self.key(sid)).await
    }

    /// Persist `session`. A declared max-age of zero destroys it instead.
    pub async fn set<P>(&self, sid: &str, session: &P) -> bool
    where
        P: SessionPayload,
    {
        let key = self.key(sid);
        match self.ttl_for(session) {
            0 => {
                tracing::debug!(sid = %sid, "Session max-age is zero, destroying");
                self.store.delete(&key).await;
                true
            }
            ttl => self.store.set(&key, session, Some(ttl)).await,
        }
    }

    pub async fn destroy(&self, sid: &str) -> bool {
        self.store.delete(&self.key(sid)).await
    }

    /// Refresh the expiry without reading or rewriting the payload.
    pub async fn touch<P>(&self, sid: &str, session: &P) -> bool
    where
        P: SessionPayload,
    {
        let key = self.key(sid);
        match self.ttl_for(session) {
            0 => self.store.delete(&key).await,
            ttl => self.store.expire(&key, ttl).await,
        }
    }

    /// Every live session, keyed by sid. Sessions that vanish or fail to
    /// decode between the scan and the read are skipped.
    pub async fn all<P>(&self) -> Vec<(String, P)>
    where
        P: SessionPayload,
    {
        let keys = self.store.scan_keys(&self.pattern()).await;
        if keys.is_empty() {
            return Vec::new();
        }
        let values = self.store.mget_typed::<P>(&keys).await;

        keys.iter()
            .zip(values)
            .filter_map(|(key, value)| {
                let sid = key.strip_prefix(&self.config.prefix)?.to_string();
                value.map(|session| (sid, session))
            })
            .collect()
    }

    pub async fn length(&self) -> usize {
        self.store.scan_keys(&self.pattern()).await.len()
    }

    /// Delete every session. Returns the number removed.
    pub async fn clear(&self) -> u64 {
        let mut removed = 0;
        for key in self.store.scan_keys(&self.pattern()).await {
            if self.store.delete(&key).await {
                removed += 1;
            }
        }
        tracing::info!(removed, prefix = %self.config.prefix, "Cleared sessions");
        removed
    }

    fn ttl_for<P: SessionPayload>(&self, session: &P) -> u64 {
        match session.max_age() {
            Some(max_age) => u64::try_from(max_age.as_millis().div_ceil(1000)).unwrap_or(u64::MAX),
            None => self.config.default_ttl_secs,
        }
    }

    fn pattern(&self) -> String {
        format!("{}*", escape_glob(&self.config.prefix))
    }
}

fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
