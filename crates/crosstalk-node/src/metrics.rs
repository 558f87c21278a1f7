//! Metrics collection and export for Crosstalk.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use crosstalk_core::BrokerError;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const MESSAGES_SENT: &str = "crosstalk_messages_sent_total";
    pub const MESSAGES_RECEIVED: &str = "crosstalk_messages_received_total";
    pub const MESSAGE_BYTES: &str = "crosstalk_message_bytes_total";
    pub const SEND_FAILURES: &str = "crosstalk_send_failures_total";
    pub const BROKER_CONNECTED: &str = "crosstalk_broker_connected";
    pub const PEERS: &str = "crosstalk_peers";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::MESSAGES_SENT, "Payloads handed to the broker");
    metrics::describe_counter!(
        names::MESSAGES_RECEIVED,
        "Payloads delivered by other servers"
    );
    metrics::describe_counter!(names::MESSAGE_BYTES, "Payload bytes by direction");
    metrics::describe_counter!(names::SEND_FAILURES, "Sends the broker refused or lost");
    metrics::describe_gauge!(
        names::BROKER_CONNECTED,
        "1 while the broker can reach peers, 0 otherwise"
    );
    metrics::describe_gauge!(names::PEERS, "Peer servers with a fresh roster");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(%addr, "Metrics server listening");
    Ok(())
}

/// Record a successful send.
pub fn record_sent(bytes: usize) {
    counter!(names::MESSAGES_SENT).increment(1);
    counter!(names::MESSAGE_BYTES, "direction" => "outbound").increment(bytes as u64);
}

/// Record a delivered payload.
pub fn record_received(bytes: usize) {
    counter!(names::MESSAGES_RECEIVED).increment(1);
    counter!(names::MESSAGE_BYTES, "direction" => "inbound").increment(bytes as u64);
}

/// Record a failed send.
pub fn record_send_failure(error: &BrokerError) {
    counter!(names::SEND_FAILURES, "reason" => failure_reason(error)).increment(1);
}

/// Update the broker gauges.
pub fn set_broker_state(connected: bool, peers: usize) {
    gauge!(names::BROKER_CONNECTED).set(if connected { 1.0 } else { 0.0 });
    gauge!(names::PEERS).set(peers as f64);
}

fn failure_reason(error: &BrokerError) -> &'static str {
    match error {
        BrokerError::TransportUnavailable(_) => "unavailable",
        BrokerError::ConnectionLost(_) => "connection_lost",
        BrokerError::Malformed(_) => "malformed",
        BrokerError::Provisioning(_) => "provisioning",
        BrokerError::Config(_) => "config",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder installed; the macros must be no-ops
        record_sent(5);
        record_received(5);
        set_broker_state(true, 2);
    }

    #[test]
    fn test_failure_reason() {
        let error = BrokerError::TransportUnavailable("no peers".into());
        assert_eq!(failure_reason(&error), "unavailable");
        record_send_failure(&error);
    }
}
