//! Lock-free, swappable flag state.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::feature_flags::{FeatureContext, FeatureFlag, FeatureFlags};

/// Shared handle to the current [`FeatureFlags`].
///
/// Readers take a single atomic load per evaluation, so call sites can (and
/// should) consult flags on every call rather than caching the answer.
/// Writers replace the whole collection; in-flight readers keep the snapshot
/// they loaded.
#[derive(Clone)]
pub struct SharedFeatureFlags {
    inner: Arc<ArcSwap<FeatureFlags>>,
}

impl SharedFeatureFlags {
    pub fn new(flags: FeatureFlags) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(flags)),
        }
    }

    /// Snapshot of the current flags.
    pub fn load(&self) -> Arc<FeatureFlags> {
        self.inner.load_full()
    }

    /// Evaluate `name` for an optional caller identity.
    pub fn is_enabled_for(&self, name: &str, identity: Option<&str>) -> bool {
        let ctx = match identity {
            Some(id) => FeatureContext::for_identity(id),
            None => FeatureContext::new(),
        };
        self.inner.load().is_enabled(name, &ctx)
    }

    pub fn is_enabled(&self, name: &str, context: &FeatureContext) -> bool {
        self.inner.load().is_enabled(name, context)
    }

    /// Replace the whole flag collection.
    pub fn replace(&self, flags: FeatureFlags) {
        tracing::info!(flags = flags.len(), "Feature flags replaced");
        self.inner.store(Arc::new(flags));
    }

    /// Insert or overwrite a single flag.
    pub fn upsert(&self, flag: FeatureFlag) {
        tracing::debug!(flag = %flag.name, enabled = flag.enabled, "Feature flag updated");
        self.inner.rcu(|current| {
            let mut next = FeatureFlags::clone(current);
            next.set(flag.clone());
            next
        });
    }
}

impl Default for SharedFeatureFlags {
    fn default() -> Self {
        Self::new(FeatureFlags::with_defaults())
    }
}

impl std::fmt::Debug for SharedFeatureFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFeatureFlags")
            .field("flags", &self.inner.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag_names::REMOTE_CACHE;

    #[test]
    fn test_upsert_is_visible_to_clones() {
        let flags = SharedFeatureFlags::default();
        let reader = flags.clone();
        assert!(reader.is_enabled_for(REMOTE_CACHE, None));

        flags.upsert(FeatureFlag::boolean(REMOTE_CACHE, false));
        assert!(!reader.is_enabled_for(REMOTE_CACHE, None));
    }

    #[test]
    fn test_identity_targeting() {
        let flags = SharedFeatureFlags::new(FeatureFlags::new());
        flags.upsert(FeatureFlag::allowlist(REMOTE_CACHE, vec!["svc-a".into()]));

        assert!(flags.is_enabled_for(REMOTE_CACHE, Some("svc-a")));
        assert!(!flags.is_enabled_for(REMOTE_CACHE, Some("svc-b")));
        assert!(!flags.is_enabled_for(REMOTE_CACHE, None));
    }

    #[test]
    fn test_replace_swaps_snapshot() {
        let flags = SharedFeatureFlags::default();
        let before = flags.load();
        flags.replace(FeatureFlags::new());

        assert_eq!(before.len(), 1);
        assert!(flags.load().is_empty());
    }
}
