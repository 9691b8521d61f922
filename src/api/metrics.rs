//! Prometheus exposition endpoint

use axum::{Router, routing::get};
use prometheus::{Encoder, TextEncoder};

/// Create metrics router
///
/// Stateless, merged after the main router takes its state.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics))
}

/// GET /metrics
async fn metrics() -> impl axum::response::IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = crate::metrics::REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(%error, "Failed to encode metrics");
    }
    (
        [("Content-Type", encoder.format_type().to_string())],
        buffer,
    )
}
