//! drover coordinator
//!
//! Keeps the cluster membership, issues and redeems join tokens, places
//! resources and drives evacuations, all behind the `/v1` HTTP API.

use std::sync::Arc;

use anyhow::Result;
use drover_coordinator::{
    api, config,
    heartbeat::{HeartbeatSweeper, HeartbeatSweeperConfig},
    state::AppState,
    store::{ClusterStore, MemoryStore, SqliteStore},
    Cluster, ClusterError, Collaborators,
};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to the configured level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting drover coordinator");
    info!(listen_addr = %config.listen_addr, member = %config.member_name, "Configuration loaded");

    if config.cluster_fingerprint.is_empty() {
        let digest = Sha256::digest(format!("{}@{}", config.member_name, config.member_address));
        config.cluster_fingerprint = hex::encode(digest);
        warn!(
            fingerprint = %config.cluster_fingerprint,
            "No cluster fingerprint configured, derived one from the member identity"
        );
    }

    let store: Arc<dyn ClusterStore> = match &config.database_path {
        Some(path) => match SqliteStore::open(path) {
            Ok(store) => {
                info!(path = %path.display(), "Cluster store opened");
                Arc::new(store)
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open cluster store");
                return Err(e.into());
            }
        },
        None => {
            warn!("No database path configured, cluster state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let cluster = Cluster::new(store, Collaborators::in_memory(), config.settings());

    match cluster.membership().bootstrap(config.member_spec()).await {
        Ok(member) => info!(member_id = %member.id, "Bootstrapped new cluster"),
        Err(ClusterError::InvalidState(_)) => info!("Joining existing cluster state"),
        Err(e) => {
            error!(error = %e, "Failed to bootstrap cluster");
            return Err(e.into());
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = HeartbeatSweeper::new(
        cluster.clone(),
        HeartbeatSweeperConfig {
            interval: config.heartbeat_interval(),
            local_member: Some(config.member_name.clone()),
        },
    );
    let sweeper_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sweeper.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(cluster, config.member_name.clone());
    let app = api::create_router(state);

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

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, sweeper_handle).await {
        warn!(error = %e, "Heartbeat sweeper did not shut down in time");
    }

    info!("Coordinator shutdown complete");
    Ok(())
}
