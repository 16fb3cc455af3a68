//! Prometheus metrics helpers for the kill-feed pipeline.
//!
//! # Usage
//!
//! ```rust,ignore
//! use killfeed_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("ingest_records_total", "server" => "7020").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: pipeline stage (`ingest_`, `parse_`, `dedupe_`, `effects_`, `scheduler_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)
//! - Labels: `server` and `kind` only; file names never become labels

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_pipeline_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_pipeline_metrics();
    Some(handle)
}

/// Serve `/metrics` on `port` from a background task.
///
/// The listener is bound before returning so a port conflict surfaces as an
/// error here rather than inside the task.
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

fn register_pipeline_metrics() {
    // =========================================================================
    // Fetch
    // =========================================================================

    describe_counter!(
        "ingest_files_total",
        "Remote files read (label: server)"
    );
    describe_counter!(
        "ingest_bytes_total",
        "Bytes read from remote files (label: server)"
    );
    describe_counter!(
        "ingest_fetch_errors_total",
        "Failed server passes (labels: server, kind)"
    );
    describe_histogram!(
        "ingest_server_pass_duration_seconds",
        "Time spent on one server's fetch-parse-apply pass"
    );

    // =========================================================================
    // Parse
    // =========================================================================

    describe_counter!(
        "parse_records_total",
        "Records produced by the parser (label: server)"
    );
    describe_counter!(
        "parse_errors_total",
        "Malformed lines skipped (label: server)"
    );
    describe_counter!(
        "parse_timestamps_flagged_total",
        "Records kept with a fallback timestamp (label: server)"
    );

    // =========================================================================
    // Dedupe
    // =========================================================================

    describe_counter!("dedupe_lookups_total", "Total fingerprint lookups");
    describe_counter!(
        "dedupe_hits_total",
        "Fingerprints already seen inside the retention window"
    );
    describe_gauge!(
        "dedupe_entries",
        "Fingerprints currently retained across all servers"
    );
    describe_counter!(
        "dedupe_evictions_total",
        "Fingerprints evicted by window expiry or capacity"
    );

    // =========================================================================
    // Effects
    // =========================================================================

    describe_counter!(
        "effects_applied_total",
        "Records applied to statistics (label: kind)"
    );
    describe_counter!(
        "effects_skipped_total",
        "Records skipped by the effects pipeline (label: reason)"
    );
    describe_counter!(
        "effects_errors_total",
        "Records whose effects failed to persist"
    );

    // =========================================================================
    // Scheduler
    // =========================================================================

    describe_counter!(
        "scheduler_ticks_total",
        "Per-server ticks by outcome (label: outcome)"
    );
    describe_counter!(
        "scheduler_ticks_skipped_total",
        "Ticks skipped because the previous one was still running"
    );
    describe_gauge!(
        "scheduler_running",
        "Whether the scheduler daemon is running (1=yes, 0=no)"
    );
    describe_gauge!(
        "scheduler_tick_running",
        "Whether a tick is currently running (1=yes, 0=no)"
    );
    describe_gauge!(
        "scheduler_slots_busy",
        "Server slots currently processing"
    );
    describe_histogram!(
        "scheduler_tick_duration_seconds",
        "Wall time of a full tick"
    );
}

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter labelled with a server id.
#[inline]
pub fn increment_for_server(name: &'static str, server: &str, count: u64) {
    metrics::counter!(name, "server" => server.to_string()).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
