//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain feed health and block heights
//! - Extrinsic submission and inclusion latency
//! - Observed events and active waits
//! - Vault setup progress

use crate::chain::ChainId;
use crate::error::{HarnessError, HarnessResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Feed metrics
    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "vault_harness_chain_block_height",
        "Latest finalized block published per chain",
        &["chain"]
    ).unwrap();

    pub static ref FEED_DISCONNECTS: CounterVec = register_counter_vec!(
        "vault_harness_feed_disconnects_total",
        "Finalized block subscriptions lost",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "vault_harness_events_observed_total",
        "Total events seen on chain feeds by name",
        &["chain", "event"]
    ).unwrap();

    pub static ref ACTIVE_WAITS: GaugeVec = register_gauge_vec!(
        "vault_harness_active_waits",
        "Observer waits not yet settled",
        &["chain"]
    ).unwrap();

    // Extrinsic metrics
    pub static ref EXTRINSICS_SUBMITTED: CounterVec = register_counter_vec!(
        "vault_harness_extrinsics_submitted_total",
        "Extrinsics submitted by call kind",
        &["chain", "call"]
    ).unwrap();

    pub static ref EXTRINSICS_REJECTED: CounterVec = register_counter_vec!(
        "vault_harness_extrinsics_rejected_total",
        "Extrinsics rejected or failed at dispatch",
        &["chain", "call"]
    ).unwrap();

    pub static ref INCLUSION_LATENCY: HistogramVec = register_histogram_vec!(
        "vault_harness_inclusion_latency_seconds",
        "Time from submission to inclusion",
        &["chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    // Setup metrics
    pub static ref SETUP_PHASE: Gauge = register_gauge!(
        "vault_harness_setup_phase",
        "Ordinal of the vault setup phase being executed"
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

    pub async fn run(&self) -> HarnessResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| HarnessError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| HarnessError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_block_height(chain: ChainId, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain.as_str()])
        .set(block_number as f64);
}

pub fn record_feed_disconnect(chain: ChainId) {
    FEED_DISCONNECTS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_event(chain: ChainId, name: &str) {
    EVENTS_OBSERVED
        .with_label_values(&[chain.as_str(), name])
        .inc();
}

pub fn record_wait_started(chain: ChainId) {
    ACTIVE_WAITS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_wait_finished(chain: ChainId) {
    ACTIVE_WAITS.with_label_values(&[chain.as_str()]).dec();
}

pub fn record_extrinsic_submitted(chain: ChainId, call: &str) {
    EXTRINSICS_SUBMITTED
        .with_label_values(&[chain.as_str(), call])
        .inc();
}

pub fn record_extrinsic_rejected(chain: ChainId, call: &str) {
    EXTRINSICS_REJECTED
        .with_label_values(&[chain.as_str(), call])
        .inc();
}

pub fn record_inclusion_latency(chain: ChainId, latency_secs: f64) {
    INCLUSION_LATENCY
        .with_label_values(&[chain.as_str()])
        .observe(latency_secs);
}

pub fn record_setup_phase(ordinal: usize) {
    SETUP_PHASE.set(ordinal as f64);
}
