//! Prometheus metrics for the Redis operator

use axum::{http::header, response::IntoResponse, routing::get, Router};
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use redis_operator::status::StatusReport;
use redis_operator::{LifecycleState, TickResult};

lazy_static::lazy_static! {
    /// Total reconciliation ticks, by handler outcome
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "redis_operator_reconciliations_total",
        "Total number of reconciliation ticks",
        &["cluster", "state", "outcome"]
    ).expect("metric can be registered");

    /// Tick duration
    pub static ref RECONCILIATION_DURATION: HistogramVec = register_histogram_vec!(
        "redis_operator_reconciliation_duration_seconds",
        "Duration of reconciliation ticks",
        &["cluster"]
    ).expect("metric can be registered");

    /// One-hot lifecycle state per cluster
    pub static ref CLUSTER_STATE: GaugeVec = register_gauge_vec!(
        "redis_operator_cluster_state",
        "Lifecycle state of each cluster (1 for the current state)",
        &["namespace", "cluster", "state"]
    ).expect("metric can be registered");

    /// Nodes per cluster, by readiness
    pub static ref NODE_COUNT: GaugeVec = register_gauge_vec!(
        "redis_operator_nodes",
        "Number of intended nodes in clusters",
        &["cluster", "ready"]
    ).expect("metric can be registered");

    /// Nodes past the loss threshold at the start of the last tick
    pub static ref LOST_NODES: GaugeVec = register_gauge_vec!(
        "redis_operator_lost_nodes",
        "Nodes considered lost at the start of the last tick",
        &["cluster"]
    ).expect("metric can be registered");

    /// Lifecycle transitions
    pub static ref TRANSITIONS: CounterVec = register_counter_vec!(
        "redis_operator_transitions_total",
        "Lifecycle state transitions",
        &["cluster", "from", "to"]
    ).expect("metric can be registered");

    /// Manual operations from the admin surface
    pub static ref MANUAL_ACTIONS: CounterVec = register_counter_vec!(
        "redis_operator_manual_actions_total",
        "Manual operations triggered through the admin API",
        &["cluster", "action", "result"]
    ).expect("metric can be registered");

    /// Operator errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "redis_operator_errors_total",
        "Total number of errors",
        &["type"]
    ).expect("metric can be registered");
}

/// Router serving `/metrics`
pub fn router() -> Router {
    Router::new().route("/metrics", get(render))
}

async fn render() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metrics = encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], metrics)
}

/// Run the metrics server
pub async fn run_metrics_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Metrics server started");
    axum::serve(listener, router()).await
}

/// Record one finished tick
pub fn record_tick(cluster: &str, result: &TickResult) {
    RECONCILIATIONS
        .with_label_values(&[cluster, result.previous.as_str(), result.outcome.as_str()])
        .inc();
    RECONCILIATION_DURATION
        .with_label_values(&[cluster])
        .observe(result.elapsed.as_secs_f64());
    LOST_NODES
        .with_label_values(&[cluster])
        .set(result.lost_nodes as f64);
    if result.previous != result.next {
        TRANSITIONS
            .with_label_values(&[cluster, result.previous.as_str(), result.next.as_str()])
            .inc();
    }
}

/// Update the lifecycle state gauge
pub fn set_cluster_state(namespace: &str, cluster: &str, current: LifecycleState) {
    for state in LifecycleState::ALL {
        let value = if state == current { 1.0 } else { 0.0 };
        CLUSTER_STATE
            .with_label_values(&[namespace, cluster, state.as_str()])
            .set(value);
    }
}

/// Update node counts from a status report
pub fn set_node_counts(cluster: &str, report: &StatusReport) {
    let ready = report.ready_nodes as f64;
    let not_ready = report.total_nodes.saturating_sub(report.ready_nodes) as f64;
    NODE_COUNT.with_label_values(&[cluster, "true"]).set(ready);
    NODE_COUNT.with_label_values(&[cluster, "false"]).set(not_ready);
}

/// Record a manual operation
pub fn record_manual_action(cluster: &str, action: &str, ok: bool) {
    let result = if ok { "success" } else { "failure" };
    MANUAL_ACTIONS.with_label_values(&[cluster, action, result]).inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
