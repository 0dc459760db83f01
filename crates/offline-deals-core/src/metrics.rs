//! Prometheus metrics helpers for the offline deals client.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used by the syncer, its workers and the archive exporter.
//!
//! # Usage
//!
//! ```rust,ignore
//! use offline_deals_core::metrics::{start_metrics_server, try_init_metrics};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = try_init_metrics().unwrap();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("sync_cycles_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`sync_`, `ledger_`, `queue_`, `download_`,
//!   `import_`, `car_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)
//! - Labels only where cardinality is fixed (queue name)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded. Returns
/// `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:<port>` and serves `/metrics` from a background task.
/// Returns once the listener is bound.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics recorded by the client.
fn register_common_metrics() {
    // =========================================================================
    // Reconciliation
    // =========================================================================

    describe_gauge!("syncer_running", "1 while the syncer is running");
    describe_counter!("sync_cycles_total", "Completed reconciliation cycles");
    describe_counter!(
        "sync_cycle_errors_total",
        "Reconciliation cycles aborted because the deal list could not be fetched"
    );
    describe_counter!(
        "sync_deals_inserted_total",
        "Deals added to the ledger on first sight"
    );
    describe_counter!(
        "sync_deals_evicted_total",
        "Records evicted from the ledger (label: reason)"
    );
    describe_gauge!("sync_remote_deals", "Deals in the last fetched remote list");
    describe_histogram!(
        "sync_cycle_duration_seconds",
        "Time spent on one reconciliation cycle"
    );

    // =========================================================================
    // Ledger
    // =========================================================================

    describe_gauge!("ledger_records", "Records currently held in the ledger");
    describe_counter!("ledger_save_errors_total", "Failed ledger snapshot writes");

    // =========================================================================
    // Queues
    // =========================================================================

    describe_counter!(
        "queue_full_total",
        "Offers dropped because the queue was full (label: queue)"
    );
    describe_gauge!("queue_depth", "Entries waiting in a queue (label: queue)");

    // =========================================================================
    // Workers
    // =========================================================================

    describe_counter!("download_attempts_total", "Download attempts");
    describe_counter!("download_failures_total", "Failed download attempts");
    describe_counter!(
        "download_reused_total",
        "Downloads skipped because a matching archive already existed"
    );
    describe_counter!("download_bytes_total", "Archive bytes written by downloads");
    describe_histogram!(
        "download_duration_seconds",
        "Time spent generating one archive"
    );
    describe_counter!("import_attempts_total", "Import attempts");
    describe_counter!("import_failures_total", "Failed import attempts");
    describe_counter!(
        "import_verification_failures_total",
        "Imports rejected because the archive size did not match"
    );

    // =========================================================================
    // Archive exporter
    // =========================================================================

    describe_counter!("car_blocks_written_total", "Blocks written into archives");
    describe_histogram!(
        "car_block_fetch_seconds",
        "Time spent fetching and decoding one block"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
///
/// Convenience wrapper around `metrics::counter!`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
///
/// Convenience wrapper around `metrics::gauge!`.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
