//! Metrics definitions for the intercom service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `intercom_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `direction`: 2 values (sent, received)
//! - `queue`: 5 values (session, source_to_dest, dest_to_source, outbound, inbound)
//! - `reason`: 2 values (timeout, refused)
//! - `outcome`: 4 values (streaming, ringing, fallback, error)
//! - `endpoint`: HTTP paths with identifiers replaced by placeholders
//!
//! Device and bridge identifiers are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Stream start buckets
/// cover the reply window (500 ms by default) with headroom for slow peers.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("intercom_stream_start".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 0.750, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set stream start buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Adjust the number of connected endpoint sockets.
///
/// Metric: `intercom_connections_active`
pub fn connection_opened() {
    gauge!("intercom_connections_active").increment(1.0);
}

/// See [`connection_opened`].
pub fn connection_closed() {
    gauge!("intercom_connections_active").decrement(1.0);
}

/// Set the number of registered call sessions.
///
/// Metric: `intercom_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("intercom_sessions_active").set(count as f64);
}

/// Set the number of registered bridges.
///
/// Metric: `intercom_bridges_active`
pub fn set_bridges_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("intercom_bridges_active").set(count as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Record an audio frame written to an endpoint.
///
/// Metric: `intercom_audio_frames_total{direction="sent"}`
pub fn record_audio_sent() {
    counter!("intercom_audio_frames_total", "direction" => "sent").increment(1);
}

/// Record an audio frame read from an endpoint.
///
/// Metric: `intercom_audio_frames_total{direction="received"}`
pub fn record_audio_received() {
    counter!("intercom_audio_frames_total", "direction" => "received").increment(1);
}

/// Record an audio frame dropped because a queue or buffer was full.
///
/// Metric: `intercom_audio_frames_dropped_total`
/// Labels: `queue`
pub fn record_audio_dropped(queue: &'static str) {
    counter!("intercom_audio_frames_dropped_total", "queue" => queue).increment(1);
}

/// Record a connection closed because of an oversized declared length.
///
/// Metric: `intercom_protocol_desync_total`
pub fn record_protocol_desync() {
    counter!("intercom_protocol_desync_total").increment(1);
}

/// Record a failed connect attempt.
///
/// Metric: `intercom_connect_failures_total`
/// Labels: `reason` (timeout, refused)
pub fn record_connect_failure(reason: &'static str) {
    counter!("intercom_connect_failures_total", "reason" => reason).increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Record how long a START/ANSWER handshake took to resolve.
///
/// Metric: `intercom_stream_start_duration_seconds`
/// Labels: `outcome` (streaming, ringing, fallback, error)
pub fn record_stream_start(outcome: &'static str, duration: Duration) {
    histogram!("intercom_stream_start_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
}

// ============================================================================
// HTTP
// ============================================================================

/// Record one control API request.
///
/// Metrics: `intercom_http_request_duration_seconds`, `intercom_http_requests_total`
/// Labels: `method`, `endpoint`, `status` / `status_code`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("intercom_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint.clone(),
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("intercom_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Replace device and bridge identifiers with placeholders.
fn normalize_endpoint(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        ["", "health" | "ready" | "metrics"] => path.to_string(),
        ["", "api", "sessions" | "bridges" | "events"] => path.to_string(),
        [
            "",
            "api",
            "sessions",
            _,
            action @ ("start" | "answer-call" | "answer" | "stop" | "decline" | "audio"),
        ] => format!("/api/sessions/{{device_id}}/{action}"),
        ["", "api", "bridges", _] => "/api/bridges/{bridge_id}".to_string(),
        _ => "/other".to_string(),
    }
}
