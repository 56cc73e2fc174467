//! Node orchestrator service.
//!
//! Places hosted workloads on existing nodes or provisions new ones on
//! Hetzner Cloud with Cloudflare DNS, and sweeps up nodes left behind by
//! interrupted provisioning workflows.

use std::sync::Arc;

use anyhow::Result;
use hoster_orchestrator::{
    api, config,
    db::Database,
    orchestrator::{LogAlertSink, Orchestrator},
    providers::{
        cloudflare::CloudflareClient, hcloud::HcloudClient, ServerCatalog,
    },
    reconcile::{StuckNodeSweeper, SweepWorker},
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to HOSTER_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting node orchestrator");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let db = match Database::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let hcloud = HcloudClient::new(&config.hcloud)?;
    let cloudflare = CloudflareClient::new(&config.cloudflare)?;

    let catalog = match hcloud.server_types().await {
        Ok(types) if !types.is_empty() => ServerCatalog::new(types),
        Ok(_) => {
            warn!("Provider returned no server types, using built-in catalog");
            ServerCatalog::builtin()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load server types, using built-in catalog");
            ServerCatalog::builtin()
        }
    };
    info!(server_types = catalog.types().len(), "Server catalog ready");

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(db.node_store()),
        Arc::new(hcloud),
        Arc::new(cloudflare),
        Arc::new(LogAlertSink),
        catalog,
        config.orchestrator.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_worker = SweepWorker::new(
        StuckNodeSweeper::new(orchestrator.clone(), config.stale),
        config.sweep_interval,
    );
    let sweep_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sweep_worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(orchestrator));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, sweep_handle).await.is_err() {
        warn!("Sweep worker did not shut down in time");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
