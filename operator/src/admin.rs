//! Administrative HTTP surface.
//!
//! Manual operations queue on the same per-instance admission lock as the
//! controller's ticks, so they never interleave with a reconciliation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use redis_operator::manual;
use redis_operator::provider::CommandOutput;
use redis_operator::status::ClusterView;
use redis_operator::OperatorError;

use crate::controller::ControllerState;
use crate::error::Error;
use crate::metrics;
use crate::status::instance_key;

/// Error returned by admin handlers
#[derive(Debug)]
pub struct AdminError(Error);

impl<E: Into<Error>> From<E> for AdminError {
    fn from(e: E) -> Self {
        AdminError(e.into())
    }
}

impl AdminError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Core(OperatorError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Core(OperatorError::NoHealthyLeader) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Core(OperatorError::Conflict(_)) => StatusCode::CONFLICT,
            Error::Core(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (self.status(), body).into_response()
    }
}

type AdminResult<T> = std::result::Result<Json<T>, AdminError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TickSummary {
    previous: String,
    next: String,
    message: String,
    lost_nodes: usize,
    elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StateResponse {
    cluster: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    ready_nodes: u32,
    total_nodes: u32,
}

/// Build the admin router
pub fn router(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/clusters/:namespace/:name/reconcile", post(handle_reconcile))
        .route("/clusters/:namespace/:name/reset", post(handle_reset))
        .route("/clusters/:namespace/:name/rebalance", post(handle_rebalance))
        .route("/clusters/:namespace/:name/fix", post(handle_fix))
        .route("/clusters/:namespace/:name/state", get(handle_state))
        .route("/clusters/:namespace/:name/view", get(handle_view))
        .with_state(state)
}

/// Serve the admin surface
pub async fn run_admin_server(port: u16, state: Arc<ControllerState>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Admin server started");
    axum::serve(listener, router(state)).await
}

async fn health_check() -> &'static str {
    "OK"
}

fn not_found(namespace: &str, name: &str) -> AdminError {
    AdminError(Error::Core(OperatorError::NotFound(instance_key(namespace, name))))
}

async fn handle_reconcile(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> AdminResult<TickSummary> {
    info!(name = %name, namespace = %namespace, "Manual reconcile requested");
    let result = state
        .tick(&namespace, &name)
        .await?
        .ok_or_else(|| not_found(&namespace, &name))?;
    Ok(Json(TickSummary {
        previous: result.previous.to_string(),
        next: result.next.to_string(),
        message: result.report.message,
        lost_nodes: result.lost_nodes,
        elapsed_ms: result.elapsed.as_millis() as u64,
    }))
}

async fn handle_reset(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> AdminResult<StateResponse> {
    let lock = state.instance_lock(&instance_key(&namespace, &name));
    let _admitted = lock.lock().await;

    let cluster = state
        .fetch(&namespace, &name)
        .await?
        .ok_or_else(|| not_found(&namespace, &name))?;
    let binding = state.bind(&cluster)?;
    let result = manual::force_reset(&binding.ctx, binding.sink.as_ref()).await;
    metrics::record_manual_action(&name, "reset", result.is_ok());
    result?;

    Ok(Json(StateResponse {
        cluster: name,
        state: redis_operator::LifecycleState::Reset.to_string(),
        message: Some("reset requested by operator".to_string()),
        ready_nodes: 0,
        total_nodes: 0,
    }))
}

async fn handle_rebalance(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> AdminResult<CommandOutput> {
    run_command(&state, &namespace, &name, "rebalance").await
}

async fn handle_fix(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> AdminResult<CommandOutput> {
    run_command(&state, &namespace, &name, "fix").await
}

async fn run_command(
    state: &ControllerState,
    namespace: &str,
    name: &str,
    action: &'static str,
) -> AdminResult<CommandOutput> {
    let lock = state.instance_lock(&instance_key(namespace, name));
    let _admitted = lock.lock().await;

    let cluster = state
        .fetch(namespace, name)
        .await?
        .ok_or_else(|| not_found(namespace, name))?;
    let binding = state.bind(&cluster)?;
    let result = match action {
        "rebalance" => manual::rebalance(&binding.ctx).await,
        _ => manual::fix(&binding.ctx).await,
    };
    metrics::record_manual_action(name, action, result.as_ref().map_or(false, |o| o.ok));
    if let Err(e) = &result {
        warn!(name = %name, action, error = %e, "Manual operation failed");
    }
    Ok(Json(result?))
}

async fn handle_state(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> AdminResult<StateResponse> {
    let cluster = state
        .fetch(&namespace, &name)
        .await?
        .ok_or_else(|| not_found(&namespace, &name))?;
    let status = cluster.status.unwrap_or_default();
    let lifecycle = status.lifecycle();
    Ok(Json(StateResponse {
        cluster: name,
        state: lifecycle.to_string(),
        message: status.message,
        ready_nodes: status.ready_nodes,
        total_nodes: status.total_nodes,
    }))
}

/// Last published view, or a fresh diagnostic probe when none was published yet.
async fn handle_view(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> AdminResult<ClusterView> {
    if let Some(view) = state.views.get(&instance_key(&namespace, &name)) {
        return Ok(Json(view));
    }

    let cluster = state
        .fetch(&namespace, &name)
        .await?
        .ok_or_else(|| not_found(&namespace, &name))?;
    let binding = state.bind(&cluster)?;
    Ok(Json(manual::diagnostics(&binding.ctx, binding.state).await?))
}
