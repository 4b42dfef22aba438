//! # Global Metrics Registry
//!
//! All Prometheus metrics for the monitor, registered once through
//! `once_cell::Lazy` statics, plus the warp route that serves the
//! exposition format. Centralizing the definitions keeps the
//! observability surface in one place.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, TextEncoder,
};
use tracing::error;
use warp::{Filter, Reply};

use crate::circuit_breaker::{CircuitBreakerStats, CircuitState};

// --- Detection metrics ---

pub static OPPORTUNITIES_DETECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arbmon_opportunities_detected_total",
        "Pool-imbalance opportunities emitted.",
        &["chain"]
    )
    .expect("Failed to register arbmon_opportunities_detected_total")
});

pub static SMALL_OPPORTUNITIES_DETECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arbmon_small_opportunities_detected_total",
        "Opportunities whose estimated profit falls in the configured small band.",
        &["chain"]
    )
    .expect("Failed to register arbmon_small_opportunities_detected_total")
});

pub static TRANSACTIONS_DETECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arbmon_transactions_detected_total",
        "Arbitrage transactions detected and persisted.",
        &["chain"]
    )
    .expect("Failed to register arbmon_transactions_detected_total")
});

// --- Chain pipeline metrics ---

pub static BLOCKS_BEHIND: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "arbmon_blocks_behind",
        "How many blocks the monitor trails the chain tip.",
        &["chain"]
    )
    .expect("Failed to register arbmon_blocks_behind")
});

pub static RPC_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "arbmon_rpc_latency_seconds",
        "RPC call latency, labeled by chain and method.",
        &["chain", "method"]
    )
    .expect("Failed to register arbmon_rpc_latency_seconds")
});

pub static RPC_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arbmon_rpc_errors_total",
        "RPC failures, labeled by chain and error kind.",
        &["chain", "kind"]
    )
    .expect("Failed to register arbmon_rpc_errors_total")
});

pub static CIRCUIT_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "arbmon_endpoint_circuit_state",
        "Per-endpoint circuit state (0=closed, 1=half-open, 2=open).",
        &["chain", "endpoint"]
    )
    .expect("Failed to register arbmon_endpoint_circuit_state")
});

// --- Streaming metrics ---

pub static WS_ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "arbmon_ws_connections_active",
        "Currently connected stream subscribers."
    )
    .expect("Failed to register arbmon_ws_connections_active")
});

pub static WS_MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "arbmon_ws_messages_sent_total",
        "Messages routed to subscriber mailboxes, labeled by type.",
        &["message_type"]
    )
    .expect("Failed to register arbmon_ws_messages_sent_total")
});

pub static WS_MESSAGES_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arbmon_ws_messages_dropped_total",
        "Messages discarded by drop-oldest mailbox backpressure."
    )
    .expect("Failed to register arbmon_ws_messages_dropped_total")
});

/// Publish one connector's breaker snapshots to the circuit-state gauge.
pub fn record_circuit_states(chain: &str, stats: &[CircuitBreakerStats]) {
    for stat in stats {
        let value = match stat.state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        CIRCUIT_STATE
            .with_label_values(&[chain, &stat.endpoint])
            .set(value);
    }
}

/// `GET /metrics` exposition route.
pub fn metrics_route(
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path("metrics").and_then(metrics_handler)
}

async fn metrics_handler() -> Result<warp::reply::Response, warp::Rejection> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(target: "metrics", err = %e, "Failed to encode metrics");
        let response = warp::reply::with_status(
            "Failed to encode metrics".to_string(),
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        );
        return Ok(response.into_response());
    }

    let response = warp::reply::with_header(
        String::from_utf8_lossy(&buffer).to_string(),
        "Content-Type",
        encoder.format_type(),
    );
    Ok(response.into_response())
}
