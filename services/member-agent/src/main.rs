//! drover member agent
//!
//! Joins the cluster on first start and heartbeats to the coordinator.

use std::time::Duration;

use anyhow::Result;
use drover_member_agent::{
    client::Capacity, config::Config, ensure_joined, heartbeat::run_heartbeat_loop,
    CoordinatorClient,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting drover member agent");
    info!(
        member = %config.member_name,
        address = %config.address,
        coordinator_url = %config.coordinator_url,
        "Configuration loaded"
    );

    let client = CoordinatorClient::new(&config)?;
    let admission = match ensure_joined(&client, &config).await {
        Ok(admission) => admission,
        Err(e) => {
            error!(error = %e, "Failed to join cluster");
            return Err(e);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let capacity = Capacity {
        cpu_millis: config.cpu_millis,
        memory_bytes: config.memory_bytes,
    };
    let heartbeat_handle = tokio::spawn(run_heartbeat_loop(
        client,
        admission.name().to_string(),
        capacity,
        config.heartbeat_interval(),
        shutdown_rx,
    ));

    info!("Member agent running");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(Duration::from_secs(10), heartbeat_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Heartbeat loop failed"),
        Ok(Err(e)) => error!(error = %e, "Heartbeat task panicked"),
        Err(_) => warn!("Timed out waiting for heartbeat loop"),
    }

    info!("Member agent stopped");
    Ok(())
}
