//! Redis Kubernetes Operator
//!
//! Manages sharded, replicated Redis clusters on Kubernetes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use redis_operator::OperatorConfig;

mod admin;
mod blueprint_cm;
mod controller;
mod crd;
mod error;
mod metrics;
mod pods;
mod redis_cli;
mod status;

use controller::{Controller, ControllerState};
use redis_cli::RedisCli;

#[derive(Parser, Debug)]
#[command(name = "redis-operator")]
#[command(about = "Kubernetes Operator for sharded, replicated Redis clusters")]
struct Args {
    /// Namespace to watch (empty for all namespaces)
    #[arg(short, long, default_value = "", env = "WATCH_NAMESPACE")]
    namespace: String,

    /// Metrics server port
    #[arg(short, long, default_value = "8080")]
    metrics_port: u16,

    /// Admin API port (manual operations and health check)
    #[arg(short, long, default_value = "8081")]
    admin_port: u16,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Operator configuration file (JSON)
    #[arg(short, long, env = "REDIS_OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the redis-cli binary
    #[arg(long, default_value = "redis-cli")]
    redis_cli: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Redis Kubernetes Operator");
    info!(namespace = %args.namespace, "Watching namespace");

    let config = match &args.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    };
    config.validate()?;

    let client = kube::Client::try_default().await?;
    let admin = RedisCli::new(args.redis_cli, config.command_timeout, config.migration_timeout);
    let state = Arc::new(ControllerState::new(client.clone(), config, admin));

    let metrics_handle = tokio::spawn(metrics::run_metrics_server(args.metrics_port));
    let admin_handle = tokio::spawn(admin::run_admin_server(args.admin_port, Arc::clone(&state)));

    let controller = Controller::new(client, args.namespace, state);
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!(error = %e, "Cluster controller error");
        }
    });

    info!("Controller started");

    // Wait for any task to complete (usually due to shutdown signal)
    tokio::select! {
        _ = controller_handle => info!("Cluster controller stopped"),
        res = metrics_handle => match res {
            Ok(Err(e)) => error!(error = %e, "Metrics server failed"),
            _ => info!("Metrics server stopped"),
        },
        res = admin_handle => match res {
            Ok(Err(e)) => error!(error = %e, "Admin server failed"),
            _ => info!("Admin server stopped"),
        },
    }

    Ok(())
}
