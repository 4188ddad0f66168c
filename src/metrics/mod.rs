//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Saga outcomes and per-phase latency
//! - Event subscriptions and signer-event delivery
//! - Target-ledger transactions
//! - Chain health

use crate::error::{BridgeError, BridgeResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Saga metrics
    pub static ref SAGAS_STARTED: CounterVec = register_counter_vec!(
        "chainsig_sagas_started_total",
        "Total sagas started by kind",
        &["kind"]
    ).unwrap();

    pub static ref SAGAS_COMPLETED: CounterVec = register_counter_vec!(
        "chainsig_sagas_completed_total",
        "Total sagas completed by kind",
        &["kind"]
    ).unwrap();

    pub static ref SAGAS_FAILED: CounterVec = register_counter_vec!(
        "chainsig_sagas_failed_total",
        "Total sagas failed by kind and error kind",
        &["kind", "error_kind"]
    ).unwrap();

    pub static ref PHASE_LATENCY: HistogramVec = register_histogram_vec!(
        "chainsig_saga_phase_latency_seconds",
        "Time spent in each saga phase",
        &["kind", "phase"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Event metrics
    pub static ref ACTIVE_SUBSCRIPTIONS: Gauge = register_gauge!(
        "chainsig_active_subscriptions",
        "Event subscriptions currently held by the broker"
    ).unwrap();

    pub static ref EVENTS_DISPATCHED: CounterVec = register_counter_vec!(
        "chainsig_signer_events_dispatched_total",
        "Signer events that resolved a pending subscription",
        &["event_type", "origin"]
    ).unwrap();

    pub static ref EVENTS_DUPLICATE: CounterVec = register_counter_vec!(
        "chainsig_signer_events_duplicate_total",
        "Signer events ignored because the subscription was already resolved",
        &["event_type"]
    ).unwrap();

    pub static ref SOURCE_SLOT: Gauge = register_gauge!(
        "chainsig_source_slot",
        "Last source-ledger slot scanned by the signer event listener"
    ).unwrap();

    // Target transaction metrics
    pub static ref TARGET_TX_BROADCAST: CounterVec = register_counter_vec!(
        "chainsig_target_transactions_broadcast_total",
        "Signed transactions broadcast to the target ledger",
        &["chain_id"]
    ).unwrap();

    pub static ref TARGET_TX_REVERTED: CounterVec = register_counter_vec!(
        "chainsig_target_transactions_reverted_total",
        "Target transactions that finished with a failed status",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "chainsig_chain_connected",
        "Target chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "chainsig_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> BridgeResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Config(format!("Cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| BridgeError::Internal(format!("Metrics server failed: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Encode the default registry in the text exposition format
pub fn render() -> BridgeResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| BridgeError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| BridgeError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_saga_started(kind: &str) {
    SAGAS_STARTED.with_label_values(&[kind]).inc();
}

pub fn record_saga_completed(kind: &str) {
    SAGAS_COMPLETED.with_label_values(&[kind]).inc();
}

pub fn record_saga_failed(kind: &str, error_kind: &str) {
    SAGAS_FAILED.with_label_values(&[kind, error_kind]).inc();
}

pub fn record_phase_latency(kind: &str, phase: &str, latency_secs: f64) {
    PHASE_LATENCY
        .with_label_values(&[kind, phase])
        .observe(latency_secs);
}

pub fn set_active_subscriptions(count: usize) {
    ACTIVE_SUBSCRIPTIONS.set(count as f64);
}

pub fn record_event_dispatched(event_type: &str, origin: &str) {
    EVENTS_DISPATCHED
        .with_label_values(&[event_type, origin])
        .inc();
}

pub fn record_duplicate_event(event_type: &str) {
    EVENTS_DUPLICATE.with_label_values(&[event_type]).inc();
}

pub fn record_source_slot(slot: u64) {
    SOURCE_SLOT.set(slot as f64);
}

pub fn record_target_tx_broadcast(chain_id: u64) {
    TARGET_TX_BROADCAST
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_target_tx_reverted(chain_id: u64) {
    TARGET_TX_REVERTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_saga_failed("withdraw", "signature_timeout");
        let text = render().unwrap();
        assert!(text.contains("chainsig_sagas_failed_total"));
        assert!(text.contains("error_kind=\"signature_timeout\""));
    }
}
