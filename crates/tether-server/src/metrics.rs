//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if a global
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Connections opened (counter).
pub const CONNECTIONS_TOTAL: &str = "tether_connections_total";
/// Connections closed (counter).
pub const CONNECTIONS_CLOSED_TOTAL: &str = "tether_connections_closed_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
/// WebSocket upgrades refused because `max_connections` was reached (counter).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tether_connections_rejected_total";
/// Connection lifetime (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "tether_connection_duration_seconds";
/// Decoded inbound messages (counter, labels: kind).
pub const MESSAGES_RECEIVED_TOTAL: &str = "tether_messages_received_total";
/// Inbound messages rejected as malformed or out of order (counter).
pub const PROTOCOL_ERRORS_TOTAL: &str = "tether_protocol_errors_total";
/// Method calls (counter, labels: method).
pub const METHOD_CALLS_TOTAL: &str = "tether_method_calls_total";
/// Failed method calls (counter, labels: method, error_type).
pub const METHOD_ERRORS_TOTAL: &str = "tether_method_errors_total";
/// Method duration including deferred work (histogram, labels: method).
pub const METHOD_DURATION_SECONDS: &str = "tether_method_duration_seconds";
/// Subscriptions started (counter, labels: publication).
pub const SUBSCRIPTIONS_STARTED_TOTAL: &str = "tether_subscriptions_started_total";
/// Subscriptions stopped (counter, labels: publication).
pub const SUBSCRIPTIONS_STOPPED_TOTAL: &str = "tether_subscriptions_stopped_total";
/// Live subscriptions (gauge).
pub const SUBSCRIPTIONS_ACTIVE: &str = "tether_subscriptions_active";
/// Reactive reruns (counter, labels: publication).
pub const SUBSCRIPTION_RERUNS_TOTAL: &str = "tether_subscription_reruns_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            CONNECTIONS_CLOSED_TOTAL,
            CONNECTIONS_ACTIVE,
            CONNECTIONS_REJECTED_TOTAL,
            CONNECTION_DURATION_SECONDS,
            MESSAGES_RECEIVED_TOTAL,
            PROTOCOL_ERRORS_TOTAL,
            METHOD_CALLS_TOTAL,
            METHOD_ERRORS_TOTAL,
            METHOD_DURATION_SECONDS,
            SUBSCRIPTIONS_STARTED_TOTAL,
            SUBSCRIPTIONS_STOPPED_TOTAL,
            SUBSCRIPTIONS_ACTIVE,
            SUBSCRIPTION_RERUNS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("tether_"), "metric '{name}' must be prefixed");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
