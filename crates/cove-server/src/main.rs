//! Cove server entry point.
//!
//! Starts the sandbox manager, the registry monitor and the HTTP API, and
//! deletes every sandbox on SIGINT or SIGTERM.

use cove_core::{RegistryMonitor, SandboxManager};
use cove_server::{http, ServerConfig};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("cove_server=info".parse()?)
                .add_directive("cove_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Cove server");

    let config = ServerConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Warn-only so development hosts without binaries still start.
    config.validate_warn();

    let manager = Arc::new(SandboxManager::with_host_defaults(config.manager_config()));

    match manager.reconcile().await {
        Ok(orphans) if !orphans.is_empty() => {
            tracing::warn!(
                count = orphans.len(),
                "Found orphan sandboxes from a previous run, purge them to reclaim resources"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Startup reconciliation failed"),
    }

    let mut monitor = RegistryMonitor::new(Arc::clone(&manager), config.monitor_interval);
    monitor.start();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_manager = Arc::clone(&manager);
    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };
        if let Err(e) = http::serve(http_manager, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    wait_for_signal().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());
    monitor.shutdown().await;

    let outcome = manager.shutdown(config.shutdown_grace).await;
    if outcome.is_success() {
        tracing::info!(count = outcome.succeeded.len(), "All sandboxes cleaned up");
    } else {
        for (sandbox_id, e) in &outcome.failed {
            tracing::error!(%sandbox_id, error = %e, "Sandbox cleanup failed");
        }
    }

    let _ = http_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
