//! Cache and rate-limit metrics.
//!
//! Recorded through the `metrics` facade; they are dropped unless the host
//! process installs a recorder.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_REMOTE_ERRORS_TOTAL: &str = "cache_remote_errors_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "rate_limit_rejections_total";
    pub const RATE_LIMIT_LOCAL_FALLBACKS_TOTAL: &str = "rate_limit_local_fallbacks_total";
}

pub fn record_cache_hit(backend: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "backend" => backend).increment(1);
}

pub fn record_cache_miss(backend: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "backend" => backend).increment(1);
}

pub fn record_remote_error(command: &str) {
    counter!(names::CACHE_REMOTE_ERRORS_TOTAL, "command" => command.to_string()).increment(1);
}

pub fn set_memory_entries(count: usize) {
    gauge!(names::CACHE_ENTRIES, "backend" => "memory").set(count as f64);
}

pub fn record_rate_limit_rejection() {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
}

pub fn record_rate_limit_local_fallback() {
    counter!(names::RATE_LIMIT_LOCAL_FALLBACKS_TOTAL).increment(1);
}
