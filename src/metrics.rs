//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record the outcome of a deploy: "online", "failed" or "cancelled"
pub fn record_deployment(outcome: &'static str) {
    metrics::counter!("fleet_manager_deployments_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// A deployment acquired a build slot
pub fn build_started() {
    metrics::gauge!("fleet_manager_builds_in_progress").increment(1.0);
}

/// A deployment released its build slot
pub fn build_finished() {
    metrics::gauge!("fleet_manager_builds_in_progress").decrement(1.0);
}

/// Record a proxied prediction: "ok", "proxy_error" or the failure reason
pub fn record_prediction(outcome: &'static str) {
    metrics::counter!("fleet_manager_predictions_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record an instance removed from the pool
pub fn record_instance_removed() {
    metrics::counter!("fleet_manager_instances_removed_total").increment(1);
}

/// Record a worker dropped after failing its health check
pub fn record_worker_failure(worker_id: i64) {
    metrics::counter!("fleet_manager_worker_failures_total",
        "worker" => worker_id.to_string()
    )
    .increment(1);
}

/// Update total worker count gauge
pub fn update_worker_count(count: usize) {
    metrics::gauge!("fleet_manager_workers_count").set(count as f64);
}

/// Update active route count gauge
pub fn update_route_count(count: usize) {
    metrics::gauge!("fleet_manager_routes_count").set(count as f64);
}
