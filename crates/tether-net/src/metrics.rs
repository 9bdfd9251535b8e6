//! Metric names and the Prometheus recorder.
//!
//! The engine records through the `metrics` facade; nothing is collected
//! until a binary installs a recorder.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Fails if another recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from an installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections established (counter, labels: role).
pub const CONNECTIONS_OPENED_TOTAL: &str = "tether_connections_opened_total";
/// Connections closed (counter, labels: role, reason).
pub const CONNECTIONS_CLOSED_TOTAL: &str = "tether_connections_closed_total";
/// Live connections (gauge, labels: role).
pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
/// Accepted transports refused over `max_connections` (counter).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tether_connections_rejected_total";
/// Frames decoded (counter).
pub const FRAMES_RECEIVED_TOTAL: &str = "tether_frames_received_total";
/// Frames written (counter).
pub const FRAMES_SENT_TOTAL: &str = "tether_frames_sent_total";
/// Sends refused because the outbound queue was full (counter).
pub const SEND_QUEUE_FULL_TOTAL: &str = "tether_send_queue_full_total";
/// Protocol violations (counter, labels: kind).
pub const PROTOCOL_ERRORS_TOTAL: &str = "tether_protocol_errors_total";
/// Frames with no registered handler (counter, labels: policy).
pub const UNKNOWN_TYPE_TOTAL: &str = "tether_unknown_type_total";
/// Handler failures and timeouts (counter, labels: outcome).
pub const HANDLER_ERRORS_TOTAL: &str = "tether_handler_errors_total";
/// Calls issued (counter).
pub const CALLS_TOTAL: &str = "tether_calls_total";
/// Calls resolved by timeout (counter).
pub const CALL_TIMEOUTS_TOTAL: &str = "tether_call_timeouts_total";
/// Responses with no matching pending call (counter).
pub const LATE_RESPONSES_TOTAL: &str = "tether_late_responses_total";
/// Time from call to response (histogram, seconds).
pub const CALL_DURATION_SECONDS: &str = "tether_call_duration_seconds";
/// Client connect attempts (counter, labels: outcome).
pub const CONNECT_ATTEMPTS_TOTAL: &str = "tether_connect_attempts_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_OPENED_TOTAL,
            CONNECTIONS_CLOSED_TOTAL,
            CONNECTIONS_ACTIVE,
            CONNECTIONS_REJECTED_TOTAL,
            FRAMES_RECEIVED_TOTAL,
            FRAMES_SENT_TOTAL,
            SEND_QUEUE_FULL_TOTAL,
            PROTOCOL_ERRORS_TOTAL,
            UNKNOWN_TYPE_TOTAL,
            HANDLER_ERRORS_TOTAL,
            CALLS_TOTAL,
            CALL_TIMEOUTS_TOTAL,
            LATE_RESPONSES_TOTAL,
            CALL_DURATION_SECONDS,
            CONNECT_ATTEMPTS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("tether_"), "{name} missing prefix");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
