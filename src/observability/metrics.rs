//! Metrics collection and exposition.
//!
//! # Metrics
//! - `netrpc_sessions_total` (counter): sessions opened, by server
//! - `netrpc_active_sessions` (gauge): live sessions, by server
//! - `netrpc_bytes_total` (counter): payload bytes, by direction
//! - `netrpc_dispatch_total` (counter): dispatched calls, by action and code
//! - `netrpc_dispatch_duration_seconds` (histogram): dispatch latency, by action
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is optional and installed once at startup

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

pub const SESSIONS_TOTAL: &str = "netrpc_sessions_total";
pub const ACTIVE_SESSIONS: &str = "netrpc_active_sessions";
pub const BYTES_TOTAL: &str = "netrpc_bytes_total";
pub const DISPATCH_TOTAL: &str = "netrpc_dispatch_total";
pub const DISPATCH_DURATION_SECONDS: &str = "netrpc_dispatch_duration_seconds";

/// Install the Prometheus recorder and its scrape listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_session_opened(server: &str, active: usize) {
    ::metrics::counter!(SESSIONS_TOTAL, "server" => server.to_string()).increment(1);
    ::metrics::gauge!(ACTIVE_SESSIONS, "server" => server.to_string()).set(active as f64);
}

pub fn record_session_closed(server: &str, active: usize) {
    ::metrics::gauge!(ACTIVE_SESSIONS, "server" => server.to_string()).set(active as f64);
}

pub fn record_bytes(direction: &'static str, bytes: usize) {
    ::metrics::counter!(BYTES_TOTAL, "direction" => direction).increment(bytes as u64);
}

pub fn record_dispatch(action: &str, code: i32, started: Instant) {
    ::metrics::counter!(
        DISPATCH_TOTAL,
        "action" => action.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
    ::metrics::histogram!(DISPATCH_DURATION_SECONDS, "action" => action.to_string())
        .record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_session_opened("Test", 1);
        record_session_closed("Test", 0);
        record_bytes("sent", 10);
        record_dispatch("Api/All", 0, Instant::now());
    }

    #[test]
    fn local_recorder_renders_dispatch() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        ::metrics::with_local_recorder(&recorder, || {
            record_dispatch("Demo/Echo", 0, Instant::now());
        });
        let output = handle.render();
        assert!(output.contains(DISPATCH_TOTAL));
        assert!(output.contains("Demo/Echo"));
    }
}
