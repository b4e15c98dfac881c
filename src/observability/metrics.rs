//! Metrics collection and exposition.
//!
//! # Metrics
//! - `web_requests_total` (counter): requests by method, status
//! - `web_active_connections` (gauge): open client connections
//! - `web_workers_spawned_total` (counter): Workers created
//! - `web_worker_respawns_total` (counter): Workers recreated for a dead socket
//! - `web_worker_exits_total` (counter): Worker exits reaped by this Frontend
//! - `web_control_commands_total` (counter): control commands by kind
//! - `web_events_posted_total` (counter): push events delivered
//!
//! # Design Decisions
//! - Recording is always on; without an installed exporter the macros are
//!   no-ops
//! - The Prometheus exporter runs only in Frontends

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &'static str, status: u16) {
    metrics::counter!("web_requests_total", "method" => method, "status" => status.to_string()).increment(1);
}

pub fn set_active_connections(n: u64) {
    metrics::gauge!("web_active_connections").set(n as f64);
}

pub fn record_worker_respawn() {
    metrics::counter!("web_worker_respawns_total").increment(1);
}

pub fn record_worker_exit() {
    metrics::counter!("web_worker_exits_total").increment(1);
}
