//! In-memory emulation of the remote KV service's REST protocol, served by
//! wiremock.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kvgate_cache::RemoteConfig;
use kvgate_cache::pattern::glob_match;
use parking_lot::Mutex;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const TOKEN: &str = "test-token";

struct Entry {
    value: String,
    expires_at: Option<Instant>,
    /// Creation order; SCAN cursors walk this so deletes never shift a page.
    seq: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl State {
    fn purge(&mut self, now: Instant) {
        self.entries
            .retain(|_, e| e.expires_at.is_none_or(|at| at > now));
    }

    fn insert(&mut self, key: &str, value: String, expires_at: Option<Instant>) {
        let seq = match self.entries.get(key) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
    }

    fn run(&mut self, args: &[String]) -> Result<Value, String> {
        let now = Instant::now();
        self.purge(now);

        let (command, rest) = args.split_first().ok_or("ERR empty command")?;
        let command = command.to_ascii_uppercase();

        match (command.as_str(), rest) {
            ("PING", []) => Ok(json!("PONG")),
            ("GET", [key]) => Ok(self
                .entries
                .get(key)
                .map_or(Value::Null, |e| json!(e.value))),
            ("SET", [key, value, options @ ..]) => {
                let nx = has_flag(options, "NX");
                let ex = option_value(options, "EX").map(parse_int).transpose()?;
                if nx && self.entries.contains_key(key) {
                    return Ok(Value::Null);
                }
                let expires_at = ex.map(|secs| now + Duration::from_secs(secs as u64));
                self.insert(key, value.clone(), expires_at);
                Ok(json!("OK"))
            }
            ("DEL", keys) if !keys.is_empty() => {
                let removed = keys
                    .iter()
                    .filter(|k| self.entries.remove(*k).is_some())
                    .count();
                Ok(json!(removed))
            }
            ("EXISTS", keys) if !keys.is_empty() => Ok(json!(
                keys.iter().filter(|k| self.entries.contains_key(*k)).count()
            )),
            ("INCR", [key]) => {
                let current = match self.entries.get(key) {
                    Some(e) => e
                        .value
                        .parse::<i64>()
                        .map_err(|_| "ERR value is not an integer or out of range".to_string())?,
                    None => 0,
                };
                let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
                self.insert(key, (current + 1).to_string(), expires_at);
                Ok(json!(current + 1))
            }
            ("EXPIRE", [key, secs, options @ ..]) => {
                let secs = parse_int(secs)?;
                let nx = has_flag(options, "NX");
                let Some(entry) = self.entries.get_mut(key) else {
                    return Ok(json!(0));
                };
                if nx && entry.expires_at.is_some() {
                    return Ok(json!(0));
                }
                if secs <= 0 {
                    self.entries.remove(key);
                } else {
                    entry.expires_at = Some(now + Duration::from_secs(secs as u64));
                }
                Ok(json!(1))
            }
            ("TTL", [key]) => Ok(json!(match self.entries.get(key) {
                None => -2,
                Some(Entry {
                    expires_at: None, ..
                }) => -1,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => at.saturating_duration_since(now).as_millis().div_ceil(1000) as i64,
            })),
            ("MGET", keys) if !keys.is_empty() => Ok(Value::Array(
                keys.iter()
                    .map(|k| self.entries.get(k).map_or(Value::Null, |e| json!(e.value)))
                    .collect(),
            )),
            ("SCAN", [cursor, options @ ..]) => {
                let cursor = parse_int(cursor)? as u64;
                let pattern = option_value(options, "MATCH").unwrap_or("*");
                let count = option_value(options, "COUNT")
                    .map(parse_int)
                    .transpose()?
                    .unwrap_or(10) as usize;

                let mut remaining: Vec<(&String, u64)> = self
                    .entries
                    .iter()
                    .filter(|(_, e)| e.seq >= cursor)
                    .map(|(k, e)| (k, e.seq))
                    .collect();
                remaining.sort_by_key(|(_, seq)| *seq);

                let page: Vec<(&String, u64)> = remaining.iter().take(count).copied().collect();
                let next = if remaining.len() > count {
                    page.last().map_or(0, |(_, seq)| seq + 1)
                } else {
                    0
                };
                let keys: Vec<String> = page
                    .into_iter()
                    .filter(|(k, _)| glob_match(pattern, k))
                    .map(|(k, _)| k.clone())
                    .collect();
                Ok(json!([next.to_string(), keys]))
            }
            ("FLUSHALL", []) => {
                self.entries.clear();
                Ok(json!("OK"))
            }
            _ => Err(format!("ERR unknown command '{command}'")),
        }
    }
}

fn has_flag(options: &[String], flag: &str) -> bool {
    options.iter().any(|o| o.eq_ignore_ascii_case(flag))
}

fn option_value<'a>(options: &'a [String], name: &str) -> Option<&'a str> {
    options
        .windows(2)
        .find(|pair| pair[0].eq_ignore_ascii_case(name))
        .map(|pair| pair[1].as_str())
}

fn parse_int(raw: &str) -> Result<i64, String> {
    raw.parse()
        .map_err(|_| "ERR value is not an integer or out of range".to_string())
}

fn reply(result: Result<Value, String>) -> Value {
    match result {
        Ok(value) => json!({ "result": value }),
        Err(error) => json!({ "error": error }),
    }
}

/// Stateful responder shared by the single-command and transaction routes.
#[derive(Clone, Default)]
pub struct FakeKv {
    state: Arc<Mutex<State>>,
}

impl FakeKv {
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.purge(Instant::now());
        state.entries.len()
    }

    /// Seed a key directly, bypassing the HTTP surface.
    pub fn insert(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state.lock().insert(key, value.to_string(), expires_at);
    }
}

impl Respond for FakeKv {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let authorized = request
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some(format!("Bearer {TOKEN}").as_str());
        if !authorized {
            return ResponseTemplate::new(401).set_body_json(json!({ "error": "Unauthorized" }));
        }

        if request.url.path() == "/multi-exec" {
            let Ok(commands) = serde_json::from_slice::<Vec<Vec<String>>>(&request.body) else {
                return ResponseTemplate::new(400)
                    .set_body_json(json!({ "error": "ERR malformed transaction" }));
            };
            // One lock for the whole transaction.
            let mut state = self.state.lock();
            let replies: Vec<Value> = commands.iter().map(|c| reply(state.run(c))).collect();
            return ResponseTemplate::new(200).set_body_json(Value::Array(replies));
        }

        let Ok(args) = serde_json::from_slice::<Vec<String>>(&request.body) else {
            return ResponseTemplate::new(400).set_body_json(json!({ "error": "ERR malformed command" }));
        };
        match self.state.lock().run(&args) {
            Ok(value) => ResponseTemplate::new(200).set_body_json(reply(Ok(value))),
            Err(error) => ResponseTemplate::new(400).set_body_json(reply(Err(error))),
        }
    }
}

/// A mock server speaking the KV protocol, its backing state and a config
/// pointing at it.
pub async fn start_fake_kv() -> (MockServer, FakeKv, RemoteConfig) {
    let server = MockServer::start().await;
    let kv = FakeKv::default();

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(kv.clone())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/multi-exec"))
        .respond_with(kv.clone())
        .mount(&server)
        .await;

    let config = RemoteConfig::new(server.uri(), TOKEN);
    (server, kv, config)
}

/// A mock server that answers every request with HTTP 500.
pub async fn start_failing_kv() -> (MockServer, RemoteConfig) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({ "error": "ERR internal error" })),
        )
        .mount(&server)
        .await;

    let mut config = RemoteConfig::new(server.uri(), TOKEN);
    config.timeout_ms = 500;
    (server, config)
}
