//! Prometheus metrics for monitoring
//!
//! Counters and gauges for order flow, interval execution, price feed
//! health, HTLC transitions, and chain connectivity.

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

use crate::error::{OrchestratorError, Result};

lazy_static! {
    // Order flow
    pub static ref ORDERS_CREATED: Counter = register_counter!(
        "aqueduct_orders_created_total",
        "Total TWAP orders created"
    )
    .unwrap();

    pub static ref ORDERS_EXPIRED: Counter = register_counter!(
        "aqueduct_orders_expired_total",
        "Total orders expired by the timeout monitor"
    )
    .unwrap();

    // Interval execution
    pub static ref INTERVALS_EXECUTED: CounterVec = register_counter_vec!(
        "aqueduct_intervals_executed_total",
        "Total TWAP intervals executed",
        &["chain_id"]
    )
    .unwrap();

    pub static ref INTERVAL_FAILURES: CounterVec = register_counter_vec!(
        "aqueduct_interval_failures_total",
        "Total interval failures by reason",
        &["reason"]
    )
    .unwrap();

    pub static ref INTERVAL_SLIPPAGE: HistogramVec = register_histogram_vec!(
        "aqueduct_interval_slippage_bps",
        "Realised slippage per executed interval",
        &["chain_id"],
        vec![0.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    )
    .unwrap();

    pub static ref EXECUTION_QUEUE_DEPTH: Gauge = register_gauge!(
        "aqueduct_execution_queue_depth",
        "Intervals currently waiting in the execution queue"
    )
    .unwrap();

    pub static ref EXECUTION_QUEUE_DROPS: Counter = register_counter!(
        "aqueduct_execution_queue_drops_total",
        "Enqueues dropped because the execution queue was full"
    )
    .unwrap();

    // Price feed
    pub static ref PRICE_POINTS: CounterVec = register_counter_vec!(
        "aqueduct_price_points_total",
        "Price points accepted by source",
        &["source"]
    )
    .unwrap();

    pub static ref PRICE_SOURCE_FAILURES: CounterVec = register_counter_vec!(
        "aqueduct_price_source_failures_total",
        "Price source failures by source",
        &["source"]
    )
    .unwrap();

    // HTLC lifecycle
    pub static ref HTLC_TRANSITIONS: CounterVec = register_counter_vec!(
        "aqueduct_htlc_transitions_total",
        "HTLC state transitions by resulting state",
        &["state"]
    )
    .unwrap();

    pub static ref CROSS_CHAIN_SWAPS: Counter = register_counter!(
        "aqueduct_cross_chain_swaps_total",
        "Cross-chain HTLC pairs created"
    )
    .unwrap();

    // Chain health
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "aqueduct_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    )
    .unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "aqueduct_chain_block_height",
        "Last observed block height per chain",
        &["chain_id"]
    )
    .unwrap();

    // Events
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "aqueduct_events_received_total",
        "Chain events received by type",
        &["chain_id", "event_type"]
    )
    .unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("metrics bind failed: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_order_created() {
    ORDERS_CREATED.inc();
}

pub fn record_order_expired() {
    ORDERS_EXPIRED.inc();
}

pub fn record_interval_executed(chain_id: &str, slippage_bps: u32) {
    INTERVALS_EXECUTED.with_label_values(&[chain_id]).inc();
    INTERVAL_SLIPPAGE
        .with_label_values(&[chain_id])
        .observe(slippage_bps as f64);
}

pub fn record_interval_failure(reason: &str) {
    INTERVAL_FAILURES.with_label_values(&[reason]).inc();
}

pub fn record_queue_depth(depth: usize) {
    EXECUTION_QUEUE_DEPTH.set(depth as f64);
}

pub fn record_queue_drop() {
    EXECUTION_QUEUE_DROPS.inc();
}

pub fn record_price_point(source: &str) {
    PRICE_POINTS.with_label_values(&[source]).inc();
}

pub fn record_price_source_failure(source: &str) {
    PRICE_SOURCE_FAILURES.with_label_values(&[source]).inc();
}

pub fn record_htlc_transition(state: &str) {
    HTLC_TRANSITIONS.with_label_values(&[state]).inc();
}

pub fn record_cross_chain_swap() {
    CROSS_CHAIN_SWAPS.inc();
}

pub fn record_chain_connected(chain_id: &str, connected: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain_id])
        .set(if connected { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain_id: &str, height: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain_id])
        .set(height as f64);
}

pub fn record_event(chain_id: &str, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[chain_id, event_type])
        .inc();
}
