//! Ledger metrics and structured log helpers.
//!
//! Metrics go through the `metrics` facade; the host process decides where
//! they are exported. Log helpers take the caller's span explicitly.

use std::time::Duration;
use tracing::Span;

// ============================================================================
// Ledger Metrics
// ============================================================================

/// Count a ledger operation by outcome (`ok`, `replayed` or an error kind).
pub fn ledger_operation(operation: &'static str, outcome: &'static str, elapsed: Duration) {
    metrics::counter!("wallet_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);

    metrics::histogram!("wallet_operation_duration_ms",
        "operation" => operation
    )
    .record(elapsed.as_secs_f64() * 1000.0);
}

/// Count reservations released by the expiry sweep.
pub fn reservations_expired(count: usize) {
    metrics::counter!("wallet_reservations_expired_total").increment(count as u64);
}

// ============================================================================
// Event Metrics
// ============================================================================

pub fn event_published(event_type: &str) {
    metrics::counter!("wallet_events_published_total",
        "event_type" => event_type.to_string()
    )
    .increment(1);
}

/// Event gave up after its publish attempts.
pub fn event_failed(event_type: &str) {
    metrics::counter!("wallet_events_failed_total",
        "event_type" => event_type.to_string()
    )
    .increment(1);
}

/// Event never reached the publisher because the queue was full or closed.
pub fn event_dropped(event_type: &str) {
    metrics::counter!("wallet_events_dropped_total",
        "event_type" => event_type.to_string()
    )
    .increment(1);
}

pub fn event_consumed(event_type: &str, outcome: &'static str) {
    metrics::counter!("wallet_events_consumed_total",
        "event_type" => event_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

// ============================================================================
// Logging
// ============================================================================

/// Log a slow ledger operation
pub fn log_slow_operation(span: &Span, operation: &str, elapsed: Duration) {
    let duration_ms = elapsed.as_millis() as u64;
    if duration_ms > 1000 {
        tracing::warn!(
            parent: span,
            operation = operation,
            duration_ms = duration_ms,
            "PERFORMANCE: Slow ledger operation"
        );
    } else {
        tracing::trace!(
            parent: span,
            operation = operation,
            duration_ms = duration_ms,
            "Ledger operation timing"
        );
    }
}
