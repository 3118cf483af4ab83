// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for prepdb.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding test harness chooses the exporter, if any.
//!
//! # Metric Naming Convention
//! - `prepdb_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `provider`: provider identity
//! - `source`: where a served database came from (queue, sibling, scratch, template)
//! - `error_type`: see [`crate::ProviderError::kind`]

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a database handed to a caller
pub fn record_database_served(provider: &str, source: &str) {
    counter!(
        "prepdb_databases_served_total",
        "provider" => provider.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record how long the backend took to produce a database
pub fn record_creation_latency(provider: &str, source: &str, duration: Duration) {
    histogram!(
        "prepdb_creation_seconds",
        "provider" => provider.to_string(),
        "source" => source.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a prefetch task submission
pub fn record_task_submitted(urgent: bool) {
    counter!(
        "prepdb_prefetch_tasks_total",
        "tier" => if urgent { "urgent" } else { "background" }
    )
    .increment(1);
}

/// Record a failed preparation
pub fn record_failure(provider: &str, error_type: &str) {
    counter!(
        "prepdb_failures_total",
        "provider" => provider.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Set the number of prepared databases waiting in pipeline queues
pub fn set_queued_instances(count: usize) {
    gauge!("prepdb_queued_instances").set(count as f64);
}

/// Record a queued database closed to stay under the instance budget
pub fn record_instance_evicted(provider: &str) {
    counter!(
        "prepdb_instances_evicted_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Record a template promotion
pub fn record_template_created(provider: &str) {
    counter!(
        "prepdb_templates_created_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Record a template closed to make room for a costlier one
pub fn record_template_evicted(provider: &str) {
    counter!(
        "prepdb_templates_evicted_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}

/// Record a clone that found its template closed and fell back
pub fn record_template_fallback(provider: &str) {
    counter!(
        "prepdb_template_fallbacks_total",
        "provider" => provider.to_string()
    )
    .increment(1);
}
