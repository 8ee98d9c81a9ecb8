//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

/// Record a new WebSocket connection of the given kind ("browser" or "robot").
pub fn record_ws_connect(kind: &'static str) {
    metrics::gauge!("ws_connections_active", "kind" => kind).increment(1.0);
}

pub fn record_ws_disconnect(kind: &'static str) {
    metrics::gauge!("ws_connections_active", "kind" => kind).decrement(1.0);
}

/// Record a browser request with its duration.
pub fn record_request(method: &str, duration_secs: f64) {
    let labels = [("method", method.to_string())];
    metrics::counter!("ws_requests_total", &labels).increment(1);
    metrics::histogram!("ws_request_duration_seconds", &labels).record(duration_secs);
}

/// Record a command forwarded to a robot.
pub fn record_command(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("commands_total", &labels).increment(1);
}

pub fn record_telemetry_relayed(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("telemetry_relayed_total", &labels).increment(1);
}

pub fn record_telemetry_dropped() {
    metrics::counter!("telemetry_dropped_total").increment(1);
}

pub fn set_robots_online(count: usize) {
    metrics::gauge!("robots_online").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder can be installed per process
        if let Ok(handle) = install_prometheus_recorder() {
            set_robots_online(2);
            let output = handle.render();
            assert!(output.is_empty() || output.contains("robots_online"));
        }
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_ws_connect("robot");
        record_ws_disconnect("robot");
        record_request("execute", 0.002);
        record_command("execute");
        record_telemetry_relayed("stdout");
        record_telemetry_dropped();
    }
}
