//! Model agent - publishes the models present on this node

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tracing::{info, warn};

use model_agent_common::retry::{retry_with_backoff, RetryConfig};
use model_agent_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use model_agent_common::DEFAULT_AGENT_NAMESPACE;
use model_agent_state::{ModelStateReconciler, ReconcilerConfig};

/// Model agent - keeps the per-node model ConfigMap up to date
#[derive(Parser, Debug)]
#[command(name = "model-agent", version, about, long_about = None)]
struct Cli {
    /// Name of the node this agent runs on (names the ConfigMap)
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Namespace holding the per-node ConfigMaps
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_AGENT_NAMESPACE)]
    namespace: String,

    /// Seconds between reconciliation passes
    #[arg(
        long,
        env = "RECONCILE_INTERVAL_SECS",
        default_value = "300",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    reconcile_interval_secs: u64,

    /// Log format: json or text
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    let client = retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "create_kube_client",
        Client::try_default,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let config = ReconcilerConfig::new(cli.node_name)
        .with_namespace(cli.namespace)
        .with_reconcile_interval(Duration::from_secs(cli.reconcile_interval_secs));

    info!(
        node = %config.node_name,
        namespace = %config.namespace,
        "Starting model agent"
    );

    let reconciler = Arc::new(ModelStateReconciler::for_cluster(config, client));
    let handle = reconciler.start_reconciliation();

    shutdown_signal().await;

    reconciler.stop_reconciliation();
    if let Err(e) = handle.await {
        warn!(error = %e, "Reconciliation task ended abnormally");
    }

    info!("Model agent stopped");
    Ok(())
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
