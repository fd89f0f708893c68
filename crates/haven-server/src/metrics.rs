//! Metrics collection and export for Haven.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use haven_core::BrokerStats;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "haven_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "haven_connections_active";
    pub const EVENTS_TOTAL: &str = "haven_events_total";
    pub const EVENTS_BYTES: &str = "haven_events_bytes";
    pub const CLIENTS_WAITING: &str = "haven_clients_waiting";
    pub const COUNSELORS_AVAILABLE: &str = "haven_counselors_available";
    pub const REQUESTS_PENDING: &str = "haven_requests_pending";
    pub const SESSIONS_ACTIVE: &str = "haven_sessions_active";
    pub const ERRORS_TOTAL: &str = "haven_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events processed");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total bytes of events processed");
    metrics::describe_gauge!(names::CLIENTS_WAITING, "Clients currently waiting for a match");
    metrics::describe_gauge!(
        names::COUNSELORS_AVAILABLE,
        "Counselors currently available for matching"
    );
    metrics::describe_gauge!(names::REQUESTS_PENDING, "Pending targeted session requests");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of active sessions");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an event crossing the wire.
pub fn record_event(bytes: usize, direction: &str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Publish the broker's registry gauges.
pub fn update_broker_gauges(stats: &BrokerStats) {
    gauge!(names::CLIENTS_WAITING).set(stats.waiting_clients as f64);
    gauge!(names::COUNSELORS_AVAILABLE).set(stats.available_counselors as f64);
    gauge!(names::REQUESTS_PENDING).set(stats.pending_requests as f64);
    gauge!(names::SESSIONS_ACTIVE).set(stats.active_sessions as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }
}
