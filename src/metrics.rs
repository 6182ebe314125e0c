// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the cache and rate limiter.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tiered_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: L1, L2, fallback
//! - `operation`: get, set, delete, invalidate
//! - `status`: hit, miss, error, success

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Record a cache operation outcome
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "tiered_cache_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "tiered_cache_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set current L1 item count
pub fn set_l1_items(count: usize) {
    gauge!("tiered_cache_l1_items").set(count as f64);
}

/// Record LRU evictions
pub fn record_eviction(count: usize) {
    counter!("tiered_cache_evictions_total").increment(count as u64);
}

/// Record entries removed because their TTL elapsed
pub fn record_expiration(count: usize) {
    counter!("tiered_cache_expirations_total").increment(count as u64);
}

/// Record an error with category for alerting
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "tiered_cache_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record bytes written to L2
pub fn record_bytes_written(bytes: usize, compressed: bool) {
    counter!(
        "tiered_cache_l2_bytes_written_total",
        "compressed" => if compressed { "true" } else { "false" }
    )
    .increment(bytes as u64);
}

/// Record the ratio (original / compressed) of one L2 payload compression
pub fn record_compression(compressor: &str, ratio: f64) {
    histogram!(
        "tiered_cache_compression_ratio",
        "compressor" => compressor.to_string()
    )
    .record(ratio);
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "tiered_cache_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an invalidation and how many keys it removed
pub fn record_invalidation(kind: &str, keys: usize) {
    counter!(
        "tiered_cache_invalidations_total",
        "kind" => kind.to_string()
    )
    .increment(1);
    counter!(
        "tiered_cache_invalidated_keys_total",
        "kind" => kind.to_string()
    )
    .increment(keys as u64);
}

/// Record a warming task outcome
pub fn record_warm(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "tiered_cache_warm_tasks_total",
        "status" => status
    )
    .increment(1);
}

/// Record warming run duration
pub fn record_warm_duration(duration: Duration) {
    histogram!("tiered_cache_warm_seconds").record(duration.as_secs_f64());
}

/// Record a rate limit decision
pub fn record_rate_limit(allowed: bool) {
    let decision = if allowed { "allowed" } else { "rejected" };
    counter!(
        "tiered_cache_rate_limit_decisions_total",
        "decision" => decision
    )
    .increment(1);
}

/// Set number of identities tracked by the rate limiter
pub fn set_rate_limit_records(count: usize) {
    gauge!("tiered_cache_rate_limit_records").set(count as f64);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "tiered_cache_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}
