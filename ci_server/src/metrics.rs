//! Prometheus metrics for orchestrator observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("ci_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record a build reaching a pipeline state.
pub fn build_status_changed(state: &str) {
    counter!("ci_builds_total", "state" => state.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("ci_build_duration_ms").record(duration_ms as f64);
}

/// Record task duration.
pub fn task_duration(duration_ms: u64) {
    histogram!("ci_task_duration_ms").record(duration_ms as f64);
}

pub fn environment_acquired() {
    gauge!("ci_active_environments").increment(1.0);
}

pub fn environment_released() {
    gauge!("ci_active_environments").decrement(1.0);
}

/// Set the number of builds waiting for a worker.
pub fn queue_depth(depth: usize) {
    gauge!("ci_queue_depth").set(depth as f64);
}

/// Record one outbound notification attempt.
pub fn webhook_delivered(ok: bool) {
    let outcome = if ok { "delivered" } else { "failed" };
    counter!("ci_webhook_deliveries_total", "outcome" => outcome).increment(1);
}

/// Record an error occurrence.
pub fn error_recorded(category: &str) {
    counter!("ci_errors_total", "category" => category.to_string()).increment(1);
}
