//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status
//! - Submissions, broadcasts, and gas bumps
//! - Terminal outcomes by failure reason

use crate::error::{FailureReason, TxServiceResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "txservice_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "txservice_transactions_submitted_total",
        "Total logical transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_BROADCASTS: CounterVec = register_counter_vec!(
        "txservice_transaction_broadcasts_total",
        "Total accepted broadcasts, including replacements",
        &["chain_id"]
    ).unwrap();

    pub static ref GAS_BUMPS: CounterVec = register_counter_vec!(
        "txservice_gas_bumps_total",
        "Total gas price escalations",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txservice_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "txservice_transactions_failed_total",
        "Total transactions failed by reason",
        &["chain_id", "reason"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "txservice_transaction_latency_seconds",
        "Time from submission to confirmation",
        &["chain_id"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "txservice_health_check_success_total",
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

    pub async fn run(&self) -> TxServiceResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::TxServiceError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::TxServiceError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Encode all registered metrics in the prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_broadcast(chain_id: u64) {
    TX_BROADCASTS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_gas_bump(chain_id: u64) {
    GAS_BUMPS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64, reason: FailureReason) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), reason.as_str()])
        .inc();
}

pub fn record_tx_latency(chain_id: u64, latency_secs: f64) {
    TX_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_failures() {
        record_tx_failed(424242, FailureReason::MaxGasPriceReached);
        let output = render().unwrap();
        assert!(output.contains("txservice_transactions_failed_total"));
        assert!(output.contains("max_gas_price_reached"));
    }
}
