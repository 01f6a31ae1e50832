//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record a new media-stream connection.
pub fn record_ws_connect() {
    metrics::gauge!("media_streams_active").increment(1.0);
    metrics::counter!("media_streams_total").increment(1);
}

/// Record a media-stream disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("media_streams_active").decrement(1.0);
}

/// Record the outcome of one greeting attempt.
pub fn record_greeting(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("greetings_total", &labels).increment(1);
}

/// Record one outbound media frame.
pub fn record_frame_sent() {
    metrics::counter!("media_frames_sent_total").increment(1);
}

/// Record an inbound frame that could not be decoded.
pub fn record_decode_error() {
    metrics::counter!("inbound_decode_errors_total").increment(1);
}
