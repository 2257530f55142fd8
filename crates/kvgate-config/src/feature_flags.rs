//! Feature flags for dynamic feature toggling
//!
//! Supports various flag types:
//! - Boolean: Simple on/off
//! - Percentage: Gradual rollout bucketed by identity hash
//! - Allowlist: Enabled for an explicit set of identities
//! - Time window: Enabled between two instants

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use time::OffsetDateTime;

use crate::ConfigError;

/// Well-known flag names consulted by the caching core.
pub mod flag_names {
    /// Route cache, counter and session calls to the remote KV service.
    pub const REMOTE_CACHE: &str = "cache.remote.enabled";
}

/// Context for evaluating feature flags
#[derive(Debug, Clone, Default)]
pub struct FeatureContext {
    /// Caller identity (user id, API key id, client IP)
    pub identity: Option<String>,
}

impl FeatureContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create context for a specific identity
    pub fn for_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            ..Default::default()
        }
    }

    fn rollout_bucket(&self, flag_name: &str) -> u8 {
        let mut hasher = DefaultHasher::new();
        flag_name.hash(&mut hasher);

        if let Some(ref identity) = self.identity {
            identity.hash(&mut hasher);
        }

        (hasher.finish() % 100) as u8
    }
}

/// Type of feature flag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureFlagType {
    /// Simple on/off toggle
    #[default]
    Boolean,
    /// Percentage-based rollout (0-100)
    Percentage {
        #[serde(default)]
        value: u8,
    },
    /// Enable for specific identities only
    Allowlist {
        #[serde(default)]
        identities: Vec<String>,
    },
    /// Enable during a time window
    TimeWindow {
        #[serde(with = "time::serde::rfc3339::option", default)]
        start: Option<OffsetDateTime>,
        #[serde(with = "time::serde::rfc3339::option", default)]
        end: Option<OffsetDateTime>,
    },
}

/// A single feature flag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    /// Flag name (e.g., "cache.remote.enabled")
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, flatten)]
    pub flag_type: FeatureFlagType,
    #[serde(default)]
    pub description: Option<String>,
}

impl FeatureFlag {
    pub fn boolean(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
            flag_type: FeatureFlagType::Boolean,
            description: None,
        }
    }

    pub fn percentage(name: impl Into<String>, percentage: u8) -> Self {
        Self {
            name: name.into(),
            enabled: percentage > 0,
            flag_type: FeatureFlagType::Percentage {
                value: percentage.min(100),
            },
            description: None,
        }
    }

    pub fn allowlist(name: impl Into<String>, identities: Vec<String>) -> Self {
        Self {
            name: name.into(),
            enabled: !identities.is_empty(),
            flag_type: FeatureFlagType::Allowlist { identities },
            description: None,
        }
    }

    pub fn time_window(
        name: impl Into<String>,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            flag_type: FeatureFlagType::TimeWindow { start, end },
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Evaluate this flag for a given context
    pub fn evaluate(&self, context: &FeatureContext) -> bool {
        if !self.enabled {
            return false;
        }

        match &self.flag_type {
            FeatureFlagType::Boolean => true,

            FeatureFlagType::Percentage { value } => context.rollout_bucket(&self.name) < *value,

            FeatureFlagType::Allowlist { identities } => context
                .identity
                .as_ref()
                .is_some_and(|id| identities.contains(id)),

            FeatureFlagType::TimeWindow { start, end } => {
                let now = OffsetDateTime::now_utc();
                start.is_none_or(|s| now >= s) && end.is_none_or(|e| now <= e)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match &self.flag_type {
            FeatureFlagType::Percentage { value } if *value > 100 => Err(ConfigError::validation(
                format!("flag {} has percentage {value} > 100", self.name),
            )),
            FeatureFlagType::TimeWindow {
                start: Some(s),
                end: Some(e),
            } if s > e => Err(ConfigError::validation(format!(
                "flag {} has a time window that ends before it starts",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Collection of feature flags
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(flatten)]
    flags: HashMap<String, FeatureFlag>,
}

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with the built-in flags the caching core reads.
    pub fn with_defaults() -> Self {
        let mut flags = Self::new();
        flags.set(
            FeatureFlag::boolean(flag_names::REMOTE_CACHE, true)
                .with_description("Use the remote KV service instead of the in-process store"),
        );
        flags
    }

    /// Insert or replace a flag
    pub fn set(&mut self, flag: FeatureFlag) {
        self.flags.insert(flag.name.clone(), flag);
    }

    pub fn get(&self, name: &str) -> Option<&FeatureFlag> {
        self.flags.get(name)
    }

    /// Check if a flag is enabled for the given context. Unknown flags are off.
    pub fn is_enabled(&self, name: &str, context: &FeatureContext) -> bool {
        self.flags
            .get(name)
            .is_some_and(|flag| flag.evaluate(context))
    }

    pub fn list(&self) -> impl Iterator<Item = &FeatureFlag> {
        self.flags.values()
    }

    /// Merge with another set of flags (other takes precedence)
    pub fn merge(&mut self, other: FeatureFlags) {
        self.flags.extend(other.flags);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.flags.values().try_for_each(FeatureFlag::validate)
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_boolean_flag() {
        let ctx = FeatureContext::new();
        assert!(FeatureFlag::boolean("cache.on", true).evaluate(&ctx));
        assert!(!FeatureFlag::boolean("cache.off", false).evaluate(&ctx));
    }

    #[test]
    fn test_percentage_bounds() {
        let ctx = FeatureContext::for_identity("user-7");
        assert!(FeatureFlag::percentage("rollout.all", 100).evaluate(&ctx));
        assert!(!FeatureFlag::percentage("rollout.none", 0).evaluate(&ctx));
    }

    #[test]
    fn test_percentage_is_stable_per_identity() {
        let flag = FeatureFlag::percentage("rollout.half", 50);
        let ctx = FeatureContext::for_identity("user-42");
        let first = flag.evaluate(&ctx);
        for _ in 0..10 {
            assert_eq!(flag.evaluate(&ctx), first);
        }
    }

    #[test]
    fn test_anonymous_rollout_buckets_by_flag_name() {
        let ctx = FeatureContext::new();
        assert_eq!(ctx.rollout_bucket("rollout.half"), ctx.rollout_bucket("rollout.half"));
        assert_eq!(
            FeatureContext::for_identity("user-42").rollout_bucket("rollout.half"),
            FeatureContext::for_identity("user-42").rollout_bucket("rollout.half")
        );
        assert!(ctx.rollout_bucket("rollout.half") < 100);
    }

    #[test]
    fn test_allowlist_flag() {
        let flag = FeatureFlag::allowlist(
            flag_names::REMOTE_CACHE,
            vec!["user-a".to_string(), "user-b".to_string()],
        );

        assert!(flag.evaluate(&FeatureContext::for_identity("user-a")));
        assert!(!flag.evaluate(&FeatureContext::for_identity("user-c")));
        assert!(!flag.evaluate(&FeatureContext::new()));
    }

    #[test]
    fn test_time_window_flag() {
        let now = OffsetDateTime::now_utc();
        let open = FeatureFlag::time_window("window.open", Some(now - Duration::hours(1)), None);
        let closed = FeatureFlag::time_window(
            "window.closed",
            Some(now - Duration::hours(2)),
            Some(now - Duration::hours(1)),
        );

        assert!(open.evaluate(&FeatureContext::new()));
        assert!(!closed.evaluate(&FeatureContext::new()));
    }

    #[test]
    fn test_unknown_flag_is_disabled() {
        let flags = FeatureFlags::with_defaults();
        assert!(flags.is_enabled(flag_names::REMOTE_CACHE, &FeatureContext::new()));
        assert!(!flags.is_enabled("does.not.exist", &FeatureContext::new()));
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut flags = FeatureFlags::with_defaults();
        let mut overrides = FeatureFlags::new();
        overrides.set(FeatureFlag::boolean(flag_names::REMOTE_CACHE, false));

        flags.merge(overrides);
        assert!(!flags.is_enabled(flag_names::REMOTE_CACHE, &FeatureContext::new()));
        assert_eq!(flags.len(), 1);
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let now = OffsetDateTime::now_utc();
        let mut flags = FeatureFlags::new();
        flags.set(FeatureFlag::time_window(
            "window.bad",
            Some(now),
            Some(now - Duration::minutes(5)),
        ));
        assert!(flags.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let raw = r#"
            ["cache.remote.enabled"]
            name = "cache.remote.enabled"
            enabled = true
            type = "allowlist"
            identities = ["tenant-1"]
        "#;
        let flags: FeatureFlags = toml::from_str(raw).unwrap();
        let ctx = FeatureContext::for_identity("tenant-1");
        assert!(flags.is_enabled(flag_names::REMOTE_CACHE, &ctx));
        assert!(!flags.is_enabled(flag_names::REMOTE_CACHE, &FeatureContext::new()));
    }

    #[test]
    fn test_json_shape_is_flat() {
        let flag = FeatureFlag::percentage("rollout.remote", 25).with_description("quarter");
        let value = serde_json::to_value(&flag).unwrap();
        assert_eq!(value["type"], "percentage");
        assert_eq!(value["value"], 25);

        let back: FeatureFlag = serde_json::from_value(value).unwrap();
        assert_eq!(back.flag_type, FeatureFlagType::Percentage { value: 25 });
        assert_eq!(back.description.as_deref(), Some("quarter"));
    }
}
