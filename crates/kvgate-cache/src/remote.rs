//! Client for the remote KV service's REST protocol.
//!
//! Each command is a JSON array posted to the service root:
//!
//! ```text
//! POST {url}             ["SET", "cache:bounty:42", "{..}", "EX", "300"]
//!   → {"result": "OK"}   |  {"error": "..."}
//! POST {url}/multi-exec  [["INCR", k], ["EXPIRE", k, "60", "NX"], ["TTL", k]]
//!   → [{"result": 3}, {"result": 0}, {"result": 57}]
//! ```
//!
//! `multi-exec` runs its commands as one transaction, which is what makes
//! [`RemoteStore::incr_with_expiry`] atomic across instances.
//!
//! Errors never leave this module: every public method logs the failure and
//! returns the documented default.

use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::{CacheError, CacheResult};
use crate::health::HealthReport;
use crate::metrics;
use crate::store::{
    CounterWindow, KeyValueStore, SCAN_BATCH, ScanPage, TTL_MISSING, effective_ttl,
};

const BACKEND: &str = "remote";

struct Endpoint {
    base: String,
    token: String,
}

/// Remote KV store.
///
/// Construction never fails. Without a URL and token the store reports
/// itself unavailable and every call returns its default without touching
/// the network.
pub struct RemoteStore {
    client: reqwest::Client,
    endpoint: Option<Endpoint>,
    timeout_ms: u64,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field(
                "endpoint",
                &self.endpoint.as_ref().map(|e| redact_url(&e.base)),
            )
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl RemoteStore {
    pub fn new(config: &RemoteConfig) -> Self {
        let client = reqwest::Client::builder().timeout(config.timeout()).build();

        let (client, endpoint) = match client {
            Ok(client) if config.is_configured() => {
                let endpoint = Endpoint {
                    base: config
                        .url
                        .as_deref()
                        .unwrap_or_default()
                        .trim_end_matches('/')
                        .to_string(),
                    token: config.token.clone().unwrap_or_default(),
                };
                (client, Some(endpoint))
            }
            Ok(client) => {
                info!("Remote cache URL or token not set; remote store disabled");
                (client, None)
            }
            Err(e) => {
                warn!(error = %e, "Failed to build HTTP client; remote store disabled");
                (reqwest::Client::default(), None)
            }
        };

        Self {
            client,
            endpoint,
            timeout_ms: config.timeout_ms,
        }
    }

    /// A store with no configuration, for callers that only want defaults.
    pub fn unconfigured() -> Self {
        Self {
            client: reqwest::Client::default(),
            endpoint: None,
            timeout_ms: RemoteConfig::default().timeout_ms,
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> CacheResult<Value> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or(CacheError::ConfigurationAbsent)?;
        let url = if path.is_empty() {
            endpoint.base.clone()
        } else {
            format!("{}/{}", endpoint.base, path)
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&endpoint.token)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(CacheError::backend(format!("unreadable response: {e}")));
            }
            Err(_) => return Err(CacheError::backend(format!("HTTP {status}"))),
        };

        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(CacheError::backend(message));
        }

        Ok(body)
    }

    fn classify(&self, e: reqwest::Error) -> CacheError {
        if e.is_timeout() {
            CacheError::Timeout {
                timeout_ms: self.timeout_ms,
            }
        } else {
            CacheError::transport(e.to_string())
        }
    }

    /// Run one command and return its `result`.
    async fn execute(&self, args: &[String]) -> CacheResult<Value> {
        let body = self.post("", args).await?;
        take_result(body)
    }

    /// Run commands as a single atomic transaction.
    async fn transaction(&self, commands: &[Vec<String>]) -> CacheResult<Vec<Value>> {
        match self.post("multi-exec", commands).await? {
            Value::Array(items) => items.into_iter().map(take_result).collect(),
            other => Err(CacheError::backend(format!(
                "expected array from multi-exec, got {other}"
            ))),
        }
    }

    /// Log a failed command and substitute the default.
    fn degrade<T>(&self, command: &str, key: &str, result: CacheResult<T>, default: T) -> T {
        match result {
            Ok(value) => value,
            Err(CacheError::ConfigurationAbsent) => {
                debug!(command, key = %key, "Remote cache not configured");
                default
            }
            Err(e) => {
                warn!(command, key = %key, error = %e, "Remote cache command failed");
                metrics::record_remote_error(command);
                default
            }
        }
    }

    async fn scan_page(&self, cursor: u64, pattern: &str, count: usize) -> CacheResult<ScanPage> {
        let reply = self
            .execute(&cmd([
                "SCAN",
                &cursor.to_string(),
                "MATCH",
                pattern,
                "COUNT",
                &count.to_string(),
            ]))
            .await?;

        let Value::Array(mut parts) = reply else {
            return Err(CacheError::backend("SCAN reply is not an array"));
        };
        if parts.len() != 2 {
            return Err(CacheError::backend("SCAN reply has wrong arity"));
        }
        let keys = parts.pop().map(string_list).transpose()?.unwrap_or_default();
        let cursor = parts.pop().as_ref().map(as_i64).transpose()?.unwrap_or(0);

        Ok(ScanPage {
            cursor: u64::try_from(cursor).unwrap_or(0),
            keys,
        })
    }

    async fn delete_matching(&self, pattern: &str) -> CacheResult<u64> {
        let mut deleted = 0u64;
        let mut cursor = 0u64;

        loop {
            let page = self.scan_page(cursor, pattern, SCAN_BATCH).await?;
            if !page.keys.is_empty() {
                let mut args = Vec::with_capacity(page.keys.len() + 1);
                args.push("DEL".to_string());
                args.extend(page.keys);
                let removed = as_i64(&self.execute(&args).await?)?;
                deleted += u64::try_from(removed).unwrap_or(0);
            }

            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(deleted)
    }
}

#[async_trait]
impl KeyValueStore for RemoteStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn is_available(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn connect(&self) -> bool {
        let Some(ref endpoint) = self.endpoint else {
            debug!("Remote cache not configured; skipping connect");
            return false;
        };
        let report = self.health_check().await;
        if report.connected {
            info!(
                url = %redact_url(&endpoint.base),
                latency_ms = report.latency_ms,
                "Connected to remote cache"
            );
        } else {
            warn!(
                url = %redact_url(&endpoint.base),
                error = report.error.as_deref().unwrap_or("unknown"),
                "Remote cache did not answer PING"
            );
        }
        report.connected
    }

    async fn get_raw(&self, key: &str) -> Option<String> {
        let result = self.execute(&cmd(["GET", key])).await.and_then(opt_string);
        let value = self.degrade("GET", key, result, None);
        if value.is_some() {
            debug!(key = %key, "cache hit (remote)");
            metrics::record_cache_hit(BACKEND);
        } else {
            debug!(key = %key, "cache miss (remote)");
            metrics::record_cache_miss(BACKEND);
        }
        value
    }

    async fn set_raw(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool {
        let mut args = cmd(["SET", key, payload]);
        if let Some(secs) = effective_ttl(ttl) {
            args.extend(cmd(["EX", &secs.to_string()]));
        }
        let result = self.execute(&args).await.map(|reply| is_ok(&reply));
        self.degrade("SET", key, result, false)
    }

    async fn set_with_tags(
        &self,
        key: &str,
        payload: &str,
        ttl: Option<u64>,
        tags: &[String],
    ) -> bool {
        // No server-side tag index; the tags travel inside the payload only.
        if !tags.is_empty() {
            debug!(key = %key, tags = ?tags, "Remote store keeps tags as unindexed metadata");
        }
        self.set_raw(key, payload, ttl).await
    }

    async fn delete(&self, key: &str) -> bool {
        let result = self
            .execute(&cmd(["DEL", key]))
            .await
            .and_then(|v| as_i64(&v));
        self.degrade("DEL", key, result, 0) > 0
    }

    async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let result = self.delete_matching(pattern).await;
        let deleted = self.degrade("SCAN/DEL", pattern, result, 0);
        debug!(pattern = %pattern, deleted, "Remote pattern delete");
        deleted
    }

    async fn exists(&self, key: &str) -> bool {
        let result = self
            .execute(&cmd(["EXISTS", key]))
            .await
            .and_then(|v| as_i64(&v));
        self.degrade("EXISTS", key, result, 0) > 0
    }

    async fn expire(&self, key: &str, ttl: u64) -> bool {
        let result = self
            .execute(&cmd(["EXPIRE", key, &ttl.to_string()]))
            .await
            .and_then(|v| as_i64(&v));
        self.degrade("EXPIRE", key, result, 0) == 1
    }

    async fn ttl(&self, key: &str) -> i64 {
        let result = self
            .execute(&cmd(["TTL", key]))
            .await
            .and_then(|v| as_i64(&v));
        self.degrade("TTL", key, result, TTL_MISSING)
    }

    async fn mget(&self, keys: &[String]) -> Vec<Option<String>> {
        let misses = || vec![None; keys.len()];
        if keys.is_empty() {
            return Vec::new();
        }

        let mut args = Vec::with_capacity(keys.len() + 1);
        args.push("MGET".to_string());
        args.extend(keys.iter().cloned());

        let result = self.execute(&args).await.and_then(|reply| match reply {
            Value::Array(items) if items.len() == keys.len() => {
                items.into_iter().map(opt_string).collect()
            }
            _ => Err(CacheError::backend("MGET reply does not match key count")),
        });
        let first = keys.first().map(String::as_str).unwrap_or_default();
        self.degrade("MGET", first, result, misses())
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> ScanPage {
        let result = self.scan_page(cursor, pattern, count).await;
        self.degrade("SCAN", pattern, result, ScanPage::default())
    }

    async fn incr(&self, key: &str) -> Option<i64> {
        let result = self
            .execute(&cmd(["INCR", key]))
            .await
            .and_then(|v| as_i64(&v))
            .map(Some);
        self.degrade("INCR", key, result, None)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: u64) -> Option<CounterWindow> {
        let secs = ttl.to_string();
        let commands = [
            cmd(["INCR", key]),
            cmd(["EXPIRE", key, &secs, "NX"]),
            cmd(["TTL", key]),
        ];

        let result = self.transaction(&commands).await.and_then(|replies| {
            let [count, _, ttl_secs] = replies.as_slice() else {
                return Err(CacheError::backend("multi-exec reply has wrong arity"));
            };
            Ok(Some(CounterWindow {
                count: as_i64(count)?,
                ttl_secs: as_i64(ttl_secs)?,
            }))
        });
        self.degrade("MULTI INCR/EXPIRE", key, result, None)
    }

    async fn set_nx(&self, key: &str, payload: &str, ttl: Option<u64>) -> bool {
        let mut args = cmd(["SET", key, payload, "NX"]);
        if let Some(secs) = effective_ttl(ttl) {
            args.extend(cmd(["EX", &secs.to_string()]));
        }
        let result = self.execute(&args).await.map(|reply| is_ok(&reply));
        let acquired = self.degrade("SET NX", key, result, false);
        if !acquired {
            debug!(key = %key, "set-if-absent lost (key exists or store unavailable)");
        }
        acquired
    }

    async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        debug!(
            tag = %tag,
            "Tag invalidation is not indexed on the remote store; use pattern-based keys"
        );
        0
    }

    async fn flush(&self) -> bool {
        let result = self
            .execute(&cmd(["FLUSHALL"]))
            .await
            .map(|reply| is_ok(&reply));
        self.degrade("FLUSHALL", "*", result, false)
    }

    async fn health_check(&self) -> HealthReport {
        if self.endpoint.is_none() {
            return HealthReport::unhealthy(BACKEND, 0, CacheError::ConfigurationAbsent.to_string());
        }

        let started = Instant::now();
        let result = self.execute(&cmd(["PING"])).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Value::String(ref pong)) if pong == "PONG" => HealthReport::healthy(BACKEND, latency_ms),
            Ok(other) => {
                HealthReport::unhealthy(BACKEND, latency_ms, format!("unexpected PING reply: {other}"))
            }
            Err(e) => HealthReport::unhealthy(BACKEND, latency_ms, e.to_string()),
        }
    }
}

fn cmd<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn take_result(mut body: Value) -> CacheResult<Value> {
    if let Some(message) = body.get("error").and_then(Value::as_str) {
        return Err(CacheError::backend(message));
    }
    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(CacheError::backend("response has neither result nor error")),
    }
}

fn as_i64(value: &Value) -> CacheResult<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| CacheError::backend(format!("integer out of range: {n}"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| CacheError::backend(format!("expected integer, got {s:?}"))),
        other => Err(CacheError::backend(format!("expected integer, got {other}"))),
    }
}

fn opt_string(value: Value) -> CacheResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Ok(Some(other.to_string())),
    }
}

fn string_list(value: Value) -> CacheResult<Vec<String>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(CacheError::backend(format!("expected key, got {other}"))),
            })
            .collect(),
        other => Err(CacheError::backend(format!("expected key list, got {other}"))),
    }
}

fn is_ok(reply: &Value) -> bool {
    reply.as_str() == Some("OK")
}

/// Hide credentials embedded in a URL before logging it.
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => raw.to_string(),
    }
}
