//! Metric names and the Prometheus recorder.
//!
//! The core records through the `metrics` facade; without an installed
//! recorder (tests) every call is a no-op.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Live client connections (gauge).
pub const CONNECTED_CLIENTS: &str = "connected_clients";
/// Inbound frames received from clients (counter).
pub const PAYLOADS_RECEIVED: &str = "payloads_received_total";
/// Inbound frames processed without error (counter).
pub const PAYLOADS_PROCESSED_SUCCESS: &str = "payloads_processed_success_total";
/// Inbound frames that failed processing (counter).
pub const PAYLOADS_PROCESSED_FAILED: &str = "payloads_processed_failed_total";
/// Control-plane payloads written to a client (counter).
pub const PAYLOADS_SENT_TO_CLIENT: &str = "payloads_sent_to_client_total";
/// Running workers per pool (gauge, label: pool).
pub const POOL_WORKERS_ACTIVE: &str = "pool_workers_active";
/// Jobs whose handler reported failure (counter, label: pool).
pub const POOL_JOBS_FAILED: &str = "pool_jobs_failed_total";

/// Install the Prometheus recorder globally. Call once at start-up.
pub fn install_recorder() -> Result<PrometheusHandle, String> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install metrics recorder: {e}"))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}
