//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Batch outcomes and latency per resource type and operation
//! - Retries of remote calls by failure kind
//! - Filter outcomes
//! - Registry size and unresolved references
//! - Datapoints written and failed
//! - Run state and duration
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Without an installed recorder every call is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use catalog_replicator::metrics;
//! use catalog_replicator::entity::ResourceType;
//! use catalog_replicator::summary::Operation;
//! use std::time::Duration;
//!
//! metrics::record_batch(ResourceType::Asset, Operation::Create, 1000, true, Duration::from_millis(250));
//! metrics::set_registry_size(ResourceType::Asset, 1000);
//! ```

use crate::entity::ResourceType;
use crate::summary::Operation;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one finished batch.
pub fn record_batch(
    resource: ResourceType,
    operation: Operation,
    items: usize,
    succeeded: bool,
    duration: Duration,
) {
    let status = if succeeded { "success" } else { "failure" };
    counter!(
        "replicator_batches_total",
        "resource" => resource.as_str(),
        "operation" => operation.as_str(),
        "status" => status
    )
    .increment(1);
    counter!(
        "replicator_items_total",
        "resource" => resource.as_str(),
        "operation" => operation.as_str(),
        "status" => status
    )
    .increment(items as u64);
    histogram!(
        "replicator_batch_duration_seconds",
        "resource" => resource.as_str(),
        "operation" => operation.as_str()
    )
    .record(duration.as_secs_f64());
    histogram!("replicator_batch_size", "resource" => resource.as_str()).record(items as f64);
}

/// Record a retried remote call. `kind` is `throttled` or `transport`.
pub fn record_retry(operation: &str, kind: &'static str) {
    counter!("replicator_retries_total", "operation" => operation.to_string(), "kind" => kind)
        .increment(1);
}

/// Record what the filter did with one source snapshot.
pub fn record_filter(resource: ResourceType, retained: usize, skipped: usize, excluded: usize) {
    counter!("replicator_filter_retained_total", "resource" => resource.as_str())
        .increment(retained as u64);
    counter!("replicator_filter_skipped_total", "resource" => resource.as_str())
        .increment(skipped as u64);
    counter!("replicator_filter_excluded_total", "resource" => resource.as_str())
        .increment(excluded as u64);
}

/// Record entities that failed with an unresolved parent reference.
pub fn record_unresolved_references(resource: ResourceType, count: usize) {
    counter!("replicator_unresolved_references_total", "resource" => resource.as_str())
        .increment(count as u64);
}

/// Record unchanged entities (no update needed).
pub fn record_unchanged(resource: ResourceType, count: usize) {
    counter!("replicator_unchanged_total", "resource" => resource.as_str()).increment(count as u64);
}

/// Set the current registry size for a resource type.
pub fn set_registry_size(resource: ResourceType, size: usize) {
    gauge!("replicator_registry_mappings", "resource" => resource.as_str()).set(size as f64);
}

/// Record datapoints written to the destination.
pub fn record_datapoints_written(count: usize) {
    counter!("replicator_datapoints_written_total").increment(count as u64);
}

/// Record datapoints that were not written. `reason` is `transform` or `write`.
pub fn record_datapoints_failed(count: usize, reason: &'static str) {
    counter!("replicator_datapoints_failed_total", "reason" => reason).increment(count as u64);
}

/// Record the run state (as a labeled gauge set to 1).
pub fn set_run_state(state: &str) {
    gauge!("replicator_run_state", "state" => state.to_string()).set(1.0);
}

/// Record a finished run.
pub fn record_run(duration: Duration, success: bool) {
    let status = if success { "success" } else { "partial" };
    counter!("replicator_runs_total", "status" => status).increment(1);
    histogram!("replicator_run_duration_seconds").record(duration.as_secs_f64());
}
