// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the hosting
//! application chooses the exporter.
//!
//! # Metric Naming Convention
//! - `study_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_bytes` suffix for size gauges
//!
//! # Labels
//! - `kind`: content or mutation kind
//! - `status`: success, error, rejected, ack, transient, permanent

use metrics::{counter, gauge};

/// Record a cache operation outcome
pub fn record_cache_op(operation: &str, status: &str) {
    counter!(
        "study_sync_cache_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record evicted items and bytes
pub fn record_eviction(count: usize, bytes: usize) {
    counter!("study_sync_evictions_total").increment(count as u64);
    counter!("study_sync_evicted_bytes_total").increment(bytes as u64);
}

/// Set current resident cache size in bytes
pub fn set_cache_bytes(bytes: usize) {
    gauge!("study_sync_cache_bytes").set(bytes as f64);
}

/// Set current cache item count
pub fn set_cache_items(count: usize) {
    gauge!("study_sync_cache_items").set(count as f64);
}

/// Record an appended mutation
pub fn record_append(kind: &str) {
    counter!(
        "study_sync_mutations_appended_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Set pending (unresolved) mutation count
pub fn set_pending_mutations(count: usize) {
    gauge!("study_sync_pending_mutations").set(count as f64);
}

/// Record one remote apply attempt and its outcome
pub fn record_apply_attempt(status: &str) {
    counter!(
        "study_sync_apply_attempts_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a finished drain pass
pub fn record_drain(acknowledged: usize, terminal: usize) {
    counter!("study_sync_drained_total").increment(acknowledged as u64);
    counter!("study_sync_terminal_total").increment(terminal as u64);
}

/// Record a reconciliation outcome
pub fn record_reconcile(status: &str) {
    counter!(
        "study_sync_reconcile_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record mutations removed by retention compaction
pub fn record_compaction(purged: u64) {
    counter!("study_sync_compacted_total").increment(purged);
}
