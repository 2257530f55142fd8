//! Health and diagnostics reporting.

use serde::Serialize;

use crate::backend::BackendKind;
use crate::memory::CacheStats;

/// Result of a store liveness probe.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub backend: &'static str,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn healthy(backend: &'static str, latency_ms: u64) -> Self {
        Self {
            backend,
            connected: true,
            latency_ms,
            error: None,
        }
    }

    pub fn unhealthy(backend: &'static str, latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            backend,
            connected: false,
            latency_ms,
            error: Some(error.into()),
        }
    }
}

/// Point-in-time view of the whole caching context.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// Backend the selector routes anonymous calls to right now.
    pub mode: BackendKind,
    pub remote_configured: bool,
    pub health: HealthReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<CacheStats>,
    /// Rate-limit windows held in process because the remote path was down.
    pub local_rate_windows: usize,
}
