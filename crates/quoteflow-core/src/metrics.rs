//! Metric recording for the distribution core.
//!
//! Recording goes through the `metrics` facade; it is a no-op until the
//! binary installs a recorder (see `quoteflow-server::metrics`).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const CACHE_EVICTIONS_TOTAL: &str = "cache_evictions_total";
    pub const CACHE_REMOTE_ERRORS_TOTAL: &str = "cache_remote_errors_total";

    // Refresh scheduler metrics
    pub const REFRESH_JOBS_TOTAL: &str = "refresh_jobs_total";
    pub const REFRESH_JOB_DURATION_SECONDS: &str = "refresh_job_duration_seconds";

    // Broadcaster metrics
    pub const WS_CONNECTIONS: &str = "ws_connections";
    pub const WS_SUBSCRIPTIONS: &str = "ws_subscriptions";
    pub const WS_MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";
    pub const WS_DELIVERY_ERRORS_TOTAL: &str = "ws_delivery_errors_total";
    pub const WS_RATE_LIMITED_TOTAL: &str = "ws_rate_limited_total";
    pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache hit.
pub fn record_cache_hit(tier: &str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Set the number of local cache entries.
pub fn set_cache_entries(count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => "local").set(count as f64);
}

/// Record entries removed by budget eviction.
pub fn record_cache_evictions(count: usize) {
    counter!(names::CACHE_EVICTIONS_TOTAL).increment(count as u64);
}

/// Record a failed or timed out remote tier call.
pub fn record_remote_error(operation: &'static str) {
    counter!(names::CACHE_REMOTE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

// =============================================================================
// Scheduler Metrics
// =============================================================================

/// Record the outcome of a refresh job execution.
pub fn record_refresh(job: &str, outcome: &'static str, duration: Duration) {
    counter!(
        names::REFRESH_JOBS_TOTAL,
        "job" => job.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    histogram!(names::REFRESH_JOB_DURATION_SECONDS, "job" => job.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Broadcaster Metrics
// =============================================================================

/// Set the connection and subscription gauges.
pub fn set_connection_gauges(connections: usize, subscriptions: usize) {
    gauge!(names::WS_CONNECTIONS).set(connections as f64);
    gauge!(names::WS_SUBSCRIPTIONS).set(subscriptions as f64);
}

/// Record messages handed to connection channels.
pub fn record_messages_sent(count: usize) {
    counter!(names::WS_MESSAGES_SENT_TOTAL).increment(count as u64);
}

/// Record failed deliveries.
pub fn record_delivery_errors(count: usize) {
    counter!(names::WS_DELIVERY_ERRORS_TOTAL).increment(count as u64);
}

/// Record a control message dropped by the rate limiter.
pub fn record_rate_limited() {
    counter!(names::WS_RATE_LIMITED_TOTAL).increment(1);
}

/// Record a refused connection.
pub fn record_rejected_connection() {
    counter!(names::WS_REJECTED_TOTAL).increment(1);
}
