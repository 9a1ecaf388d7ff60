//! Transaction service - multi-chain transaction submission and confirmation
//!
//! Submits signed transactions through multi-endpoint RPC connections and
//! drives each one to finality, replacing stuck transactions at a higher gas
//! price under the same nonce.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod metrics;
mod tx;

#[cfg(test)]
mod test_utils;

use chain::ConnectionRegistry;
use config::Settings;
use metrics::MetricsServer;
use tx::{TransactionService, WalletSigner};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting txservice v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let signer = WalletSigner::from_env(&settings.wallet.private_key_env)
        .context("Failed to load signing key")?;

    // One connection per chain, shared by every submission
    let connections = Arc::new(
        ConnectionRegistry::from_settings(&settings)
            .await
            .context("Failed to initialize chain connections")?,
    );
    info!("Chain connections initialized");

    let service = Arc::new(TransactionService::new(
        connections.clone(),
        Arc::new(signer),
        settings.tx_service_config(),
    ));
    info!(
        "Transaction service initialized with signer {:?}",
        service.signer_address()
    );

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let service = service.clone();
        async move {
            if let Err(e) = api::run_server(config, service).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let connections = connections.clone();
        let interval = settings.service.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                for (chain_id, healthy) in connections.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                    }
                }

                metrics::record_health_check();
            }
        }
    });

    info!("txservice is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("txservice stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,txservice=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
