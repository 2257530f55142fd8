use kvgate_config::FeatureFlags;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the whole caching context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Feature flags; the built-in defaults are used when absent.
    #[serde(default = "FeatureFlags::with_defaults")]
    pub flags: FeatureFlags,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            fallback: FallbackConfig::default(),
            rate_limit: RateLimitConfig::default(),
            session: SessionConfig::default(),
            flags: FeatureFlags::with_defaults(),
        }
    }
}

/// Longest accepted rate-limit window (one year).
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid settings: {0}")]
    Validation(String),

    #[error(transparent)]
    Flags(#[from] kvgate_config::ConfigError),
}

impl CacheSettings {
    /// Missing remote credentials are valid: the remote store then reports
    /// itself unavailable.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if let Some(ref raw) = self.remote.url {
            let parsed = url::Url::parse(raw)
                .map_err(|e| SettingsError::Validation(format!("remote.url is invalid: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SettingsError::Validation(
                    "remote.url must use http or https".into(),
                ));
            }
        }
        if self.remote.timeout_ms == 0 {
            return Err(SettingsError::Validation("remote.timeout_ms must be > 0".into()));
        }
        if self.fallback.cleanup_interval_secs == 0 {
            return Err(SettingsError::Validation(
                "fallback.cleanup_interval_secs must be > 0".into(),
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(SettingsError::Validation(
                "rate_limit.max_requests must be > 0".into(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(SettingsError::Validation(
                "rate_limit.window_secs must be > 0".into(),
            ));
        }
        if self.rate_limit.window_secs > MAX_WINDOW_SECS {
            return Err(SettingsError::Validation(format!(
                "rate_limit.window_secs must be <= {MAX_WINDOW_SECS}"
            )));
        }
        if self.rate_limit.cleanup_interval_secs == 0 {
            return Err(SettingsError::Validation(
                "rate_limit.cleanup_interval_secs must be > 0".into(),
            ));
        }
        if self.session.prefix.is_empty() {
            return Err(SettingsError::Validation("session.prefix must not be empty".into()));
        }
        if self.session.default_ttl_secs == 0 {
            return Err(SettingsError::Validation(
                "session.default_ttl_secs must be > 0".into(),
            ));
        }
        self.flags.validate()?;
        Ok(())
    }
}

/// Remote KV service (REST protocol).
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Service base URL, e.g. "https://eu1-kv.example.io"
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_remote_timeout_ms() -> u64 {
    2000
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            token: Some(token.into()),
            timeout_ms: default_remote_timeout_ms(),
        }
    }

    /// Both URL and token are present and non-empty.
    pub fn is_configured(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.url) && present(&self.token)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_ms: default_remote_timeout_ms(),
        }
    }
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// In-process fallback store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Route to the in-process store when the remote one is off or
    /// unconfigured. When false those calls get the unavailable defaults.
    #[serde(default = "default_fallback_enabled")]
    pub enabled: bool,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_fallback_enabled() -> bool {
    true
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: default_fallback_enabled(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Fixed-window rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_rate_limit_prefix")]
    pub key_prefix: String,

    /// Sweep interval for in-process windows
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_rate_limit_prefix() -> String {
    "ratelimit".to_string()
}

impl RateLimitConfig {
    pub fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
            ..Self::default()
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            key_prefix: default_rate_limit_prefix(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Session persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_prefix")]
    pub prefix: String,

    /// Used when a session declares no max-age
    #[serde(default = "default_session_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_session_prefix() -> String {
    "sess:".to_string()
}

fn default_session_ttl_secs() -> u64 {
    7 * 24 * 60 * 60 // one week
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefix: default_session_prefix(),
            default_ttl_secs: default_session_ttl_secs(),
        }
    }
}

pub mod loader {
    use super::{CacheSettings, SettingsError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "kvgate.toml";

    /// Load settings from an optional TOML file plus `KVGATE__*` overrides,
    /// e.g. `KVGATE__REMOTE__TOKEN=...`.
    pub fn load_settings(path: Option<&str>) -> Result<CacheSettings, SettingsError> {
        let file = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        let mut builder = Config::builder();
        if file.exists() {
            builder = builder.add_source(File::from(file));
        } else if path.is_some() {
            tracing::warn!(path = %file.display(), "Config file not found, using defaults");
        }
        builder = builder.add_source(
            Environment::with_prefix("KVGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: CacheSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = CacheSettings::default();
        settings.validate().unwrap();
        assert!(!settings.remote.is_configured());
        assert!(settings.fallback.enabled);
        assert_eq!(settings.session.default_ttl_secs, 604_800);
        assert_eq!(settings.rate_limit.key_prefix, "ratelimit");
    }

    #[test]
    fn test_remote_configured_requires_both_parts() {
        let mut remote = RemoteConfig::new("https://kv.example.io", "tok");
        assert!(remote.is_configured());

        remote.token = Some("  ".into());
        assert!(!remote.is_configured());

        remote.token = Some("tok".into());
        remote.url = None;
        assert!(!remote.is_configured());
    }

    #[test]
    fn test_debug_redacts_token() {
        let remote = RemoteConfig::new("https://kv.example.io", "super-secret");
        let rendered = format!("{remote:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut settings = CacheSettings::default();
        settings.remote.url = Some("redis://localhost:6379".into());
        assert!(settings.validate().is_err());

        settings.remote.url = Some("not a url".into());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_window_bounds() {
        let mut settings = CacheSettings::default();
        settings.rate_limit.window_secs = 0;
        assert!(settings.validate().is_err());

        settings.rate_limit.window_secs = MAX_WINDOW_SECS;
        settings.validate().unwrap();
        settings.rate_limit.window_secs = u64::MAX;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[remote]
url = "https://kv.example.io"
token = "abc"
timeout_ms = 500

[rate_limit]
max_requests = 5
window_secs = 60

[session]
prefix = "app:sess:"
"#
        )
        .unwrap();

        let settings = loader::load_settings(file.path().to_str()).unwrap();
        assert!(settings.remote.is_configured());
        assert_eq!(settings.remote.timeout_ms, 500);
        assert_eq!(settings.rate_limit.max_requests, 5);
        assert_eq!(settings.session.prefix, "app:sess:");
        assert_eq!(settings.session.default_ttl_secs, 604_800);
        assert!(settings.flags.get("cache.remote.enabled").is_some());
    }
}
