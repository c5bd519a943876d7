//! Prometheus metrics for the control plane.
//!
//! Flow telemetry pushed by hubs lands here: per-stream counters, hub
//! gauges, and process-wide totals. The `/metrics` endpoint on the ops
//! listener exposes the registry for scraping.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Stream telemetry
pub static STREAM_MESSAGES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("control_stream_messages_total", "Messages per flow"),
        &["flow", "hub", "agent", "service", "account"],
    )
    .expect("metric creation failed")
});

pub static STREAM_BYTES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("control_stream_bytes_total", "Bytes per flow"),
        &["flow", "hub", "agent", "service", "account"],
    )
    .expect("metric creation failed")
});

pub static HUB_STREAMS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("control_hub_streams", "Active streams per hub agent"),
        &["hub", "agent", "account"],
    )
    .expect("metric creation failed")
});

pub static AGENTS_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("control_agents_active", "Active agents per hub"),
        &["hub"],
    )
    .expect("metric creation failed")
});

// Process-wide totals
pub static TOTAL_MESSAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "control_total_messages",
        "Total messages across all hub sessions",
    )
    .expect("metric creation failed")
});

pub static TOTAL_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("control_total_bytes", "Total bytes across all hub sessions")
        .expect("metric creation failed")
});

// Session state
pub static CONNECTED_HUBS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("control_connected_hubs", "Currently connected hub sessions")
        .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent; subsequent calls are no-ops so integration tests can
/// embed multiple servers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(STREAM_MESSAGES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(STREAM_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(HUB_STREAMS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(AGENTS_ACTIVE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TOTAL_MESSAGES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TOTAL_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CONNECTED_HUBS.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register() {
        register_metrics();
        register_metrics();
    }
}
