//! Metrics collection and export for Ripple.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use ripple_protocol::events;
use ripple_transport::CoordinatorStatus;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "ripple_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "ripple_connections_active";
    pub const MESSAGES_TOTAL: &str = "ripple_messages_total";
    pub const MESSAGES_BYTES: &str = "ripple_messages_bytes";
    pub const REQUESTS_TOTAL: &str = "ripple_requests_total";
    pub const LATENCY_SECONDS: &str = "ripple_latency_seconds";
    pub const ERRORS_TOTAL: &str = "ripple_errors_total";
    pub const PROVIDER_ACTIVE: &str = "ripple_provider_active";
    pub const PROVIDER_HEALTHY: &str = "ripple_provider_healthy";
    pub const FAILOVERS: &str = "ripple_failovers";
    pub const SUBSCRIBED_USERS: &str = "ripple_subscribed_users";
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
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(names::REQUESTS_TOTAL, "Client requests by event");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Request processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_gauge!(names::PROVIDER_ACTIVE, "1 for the active provider");
    metrics::describe_gauge!(names::PROVIDER_HEALTHY, "1 for each healthy provider");
    metrics::describe_gauge!(names::FAILOVERS, "Provider switches since start");
    metrics::describe_gauge!(
        names::SUBSCRIBED_USERS,
        "Users with at least one subscription"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

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

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a handled client request.
pub fn record_request(event: &str, seconds: f64) {
    counter!(names::REQUESTS_TOTAL, "event" => request_label(event)).increment(1);
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Bounded label for a client event name.
fn request_label(event: &str) -> &'static str {
    match event {
        events::SUBSCRIBE => events::SUBSCRIBE,
        events::UNSUBSCRIBE => events::UNSUBSCRIBE,
        events::PING => events::PING,
        events::RECONNECT => events::RECONNECT,
        _ => "unknown",
    }
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish the coordinator's state as gauges.
pub fn record_status(status: &CoordinatorStatus) {
    for provider in &status.providers {
        let kind = provider.kind.as_str();
        gauge!(names::PROVIDER_ACTIVE, "provider" => kind).set(flag(provider.active));
        gauge!(names::PROVIDER_HEALTHY, "provider" => kind).set(flag(provider.healthy));
    }
    gauge!(names::FAILOVERS).set(status.failovers as f64);
    gauge!(names::SUBSCRIBED_USERS).set(status.subscribed_users as f64);
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
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
