//! Prometheus metrics export for the wallet service.
//!
//! The ledger library records through the `metrics` facade; this module
//! installs the exporter and registers descriptions for the series it emits.
//! Metrics are exposed in Prometheus text format at `http://<addr>/metrics`.
//!
//! # Metrics Categories
//!
//! - **Ledger Metrics**: Operations by outcome, latency, contention give-ups
//! - **Reservation Metrics**: Holds released by the expiry sweep
//! - **Event Metrics**: Events published, failed, dropped and consumed
//! - **Database Metrics**: Connection pool size

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize Prometheus metrics exporter.
///
/// Sets up a Prometheus scrape endpoint on the specified address and
/// describes every series the service records.
///
/// # Arguments
///
/// - `addr`: Address to bind the metrics server to (e.g., `0.0.0.0:9090`)
///
/// # Returns
///
/// Result indicating success or error message
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {}", e))?;

    describe_metrics();
    Ok(())
}

/// Register help text for the service's metrics
pub fn describe_metrics() {
    describe_counter!(
        "wallet_operations_total",
        "Ledger operations by operation and outcome"
    );
    describe_histogram!(
        "wallet_operation_duration_ms",
        Unit::Milliseconds,
        "Ledger operation latency"
    );
    describe_counter!(
        "wallet_busy_total",
        "Units of work abandoned after exhausting contention retries"
    );
    describe_counter!(
        "wallet_reservations_expired_total",
        "Reservations released by the expiry sweep"
    );
    describe_counter!(
        "wallet_events_published_total",
        "Ledger events delivered to the bus"
    );
    describe_counter!(
        "wallet_events_failed_total",
        "Ledger events abandoned after their publish attempts"
    );
    describe_counter!(
        "wallet_events_dropped_total",
        "Ledger events dropped before reaching the publisher"
    );
    describe_counter!(
        "wallet_events_consumed_total",
        "Inbound events by type and outcome"
    );
    describe_gauge!("db_connections_active", "Open database connections");
}

// ============================================================================
// Database Metrics
// ============================================================================

/// Set current database connection pool size.
pub fn db_connections_active(count: u32) {
    metrics::gauge!("db_connections_active").set(count as f64);
}
