//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replication attempts and per-destination outcomes
//! - Batch sizes and send latency
//! - Failure depth per destination
//! - Empty-batch cursor bumps
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one controller tick.
pub fn record_tick(destination_count: usize) {
    counter!("replication_ticks_total").increment(1);
    gauge!("replication_destinations").set(destination_count as f64);
}

/// Record a worker outcome for a destination.
pub fn record_worker_outcome(url: &str, outcome: &str) {
    counter!("replication_worker_outcomes_total", "url" => url.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record documents shipped to a destination.
pub fn record_documents_sent(url: &str, count: usize) {
    counter!("replication_documents_sent_total", "url" => url.to_string()).increment(count as u64);
}

/// Record attachments shipped to a destination.
pub fn record_attachments_sent(url: &str, count: usize) {
    counter!("replication_attachments_sent_total", "url" => url.to_string()).increment(count as u64);
}

/// Record a send round-trip latency.
pub fn record_send_latency(url: &str, operation: &str, duration: Duration) {
    histogram!(
        "replication_send_duration_seconds",
        "url" => url.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an empty-batch cursor bump.
pub fn record_etag_bump(url: &str) {
    counter!("replication_etag_bumps_total", "url" => url.to_string()).increment(1);
}

/// Track the current failure depth of a destination.
pub fn set_destination_failure_count(url: &str, count: u64) {
    gauge!("replication_destination_failure_count", "url" => url.to_string()).set(count as f64);
}

/// Record a destination skipped by the failure throttle.
pub fn record_destination_skipped(url: &str) {
    counter!("replication_destination_skips_total", "url" => url.to_string()).increment(1);
}

/// Record an outbound sibling heartbeat attempt.
pub fn record_sibling_heartbeat(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_sibling_heartbeats_total", "status" => status).increment(1);
}

/// Record a prefetcher disposed by reconciliation.
pub fn record_prefetcher_disposed(reason: &str) {
    counter!("replication_prefetchers_disposed_total", "reason" => reason.to_string()).increment(1);
}
