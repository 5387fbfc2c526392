//! Prometheus metrics for reconciliation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Encoder,
    Histogram, HistogramVec, TextEncoder,
};

/// Counter for reconciliation decisions by outcome.
pub static DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_decisions_total",
        "Total number of reconciliation decisions",
        &["decision"]
    )
    .expect("Failed to register DECISIONS")
});

/// Counter for selected matches by match type.
pub static TRANSACTION_MATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_transaction_matches_total",
        "Total number of transaction matches",
        &["match_type"]
    )
    .expect("Failed to register TRANSACTION_MATCHES")
});

/// Counter for AI fallback calls by outcome.
pub static AI_FALLBACK_CALLS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_ai_fallback_total",
        "Total number of AI fallback invocations",
        &["outcome"]
    )
    .expect("Failed to register AI_FALLBACK_CALLS")
});

/// Counter for optimistic-concurrency conflicts during allocation.
pub static ALLOCATION_CONFLICTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_allocation_conflicts_total",
        "Total number of invoice version conflicts during allocation",
        &["resolution"]
    )
    .expect("Failed to register ALLOCATION_CONFLICTS")
});

/// Histogram for store query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_db_query_duration_seconds",
        "Store query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Histogram for end-to-end per-transaction pipeline duration.
pub static PIPELINE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "reconciliation_pipeline_duration_seconds",
        "Per-transaction pipeline duration in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register PIPELINE_DURATION")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DECISIONS);
    Lazy::force(&TRANSACTION_MATCHES);
    Lazy::force(&AI_FALLBACK_CALLS);
    Lazy::force(&ALLOCATION_CONFLICTS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PIPELINE_DURATION);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a reconciliation decision.
pub fn record_decision(decision: &str) {
    DECISIONS.with_label_values(&[decision]).inc();
}

/// Record a selected match.
pub fn record_transaction_match(match_type: &str) {
    TRANSACTION_MATCHES.with_label_values(&[match_type]).inc();
}

/// Record an AI fallback invocation.
pub fn record_ai_fallback(outcome: &str) {
    AI_FALLBACK_CALLS.with_label_values(&[outcome]).inc();
}

/// Record an allocation version conflict.
pub fn record_allocation_conflict(resolution: &str) {
    ALLOCATION_CONFLICTS.with_label_values(&[resolution]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
