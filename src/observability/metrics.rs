//! Metrics registration and recording.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::ObservabilityConfig;

/// Installs the Prometheus exporter when metrics are enabled.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<(), String> {
    if !config.metrics_enabled {
        return Ok(());
    }
    let addr: SocketAddr = config
        .metrics_address
        .parse()
        .map_err(|e| format!("invalid metrics address: {e}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install metrics exporter: {e}"))?;

    describe_counter!(
        "peergate_proxy_requests_total",
        "Proxy exchanges by cache outcome and status"
    );
    describe_counter!(
        "peergate_sessions_total",
        "Sessions accepted by the connection server"
    );
    describe_gauge!("peergate_sessions_active", "Currently running sessions");
    describe_counter!(
        "peergate_denied_connections_total",
        "Connections rejected from denied hosts"
    );
    describe_counter!("peergate_tunnels_total", "CONNECT tunnels established");

    tracing::info!(address = %addr, "metrics exporter listening");
    Ok(())
}

pub fn record_session_started() {
    counter!("peergate_sessions_total").increment(1);
    gauge!("peergate_sessions_active").increment(1.0);
}

pub fn record_session_finished() {
    gauge!("peergate_sessions_active").decrement(1.0);
}

pub fn record_denied_connection() {
    counter!("peergate_denied_connections_total").increment(1);
}

pub fn record_proxy_request(outcome: &'static str, status: u16) {
    counter!(
        "peergate_proxy_requests_total",
        "outcome" => outcome,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_tunnel_established() {
    counter!("peergate_tunnels_total").increment(1);
}
