//! Heartbeat loop keeping the coordinator's view of this member fresh.
//!
//! A heartbeat carries the member's capacity. On shutdown the loop sends one
//! last heartbeat flagged `shutting_down` so the coordinator marks the
//! member offline right away instead of waiting for missed beats.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{Capacity, CoordinatorClient, HeartbeatRequest};

/// Consecutive failures logged at `warn` before escalating to `error`.
const QUIET_FAILURES: u32 = 3;

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    client: CoordinatorClient,
    member_name: String,
    capacity: Capacity,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        member = %member_name,
        interval_secs = interval.as_secs_f64(),
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let request = HeartbeatRequest {
                    capacity: Some(capacity),
                    shutting_down: false,
                };

                match client.send_heartbeat(&member_name, &request).await {
                    Ok(response) => {
                        consecutive_failures = 0;
                        debug!(
                            accepted = response.accepted,
                            status = %response.status,
                            next_interval = response.next_heartbeat_secs,
                            "Heartbeat acknowledged"
                        );
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= QUIET_FAILURES {
                            warn!(error = %e, consecutive_failures, "Heartbeat failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Heartbeat failed repeatedly");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    let farewell = HeartbeatRequest {
        capacity: None,
        shutting_down: true,
    };
    match client.send_heartbeat(&member_name, &farewell).await {
        Ok(response) => info!(status = %response.status, "Announced shutdown"),
        Err(e) => warn!(error = %e, "Failed to announce shutdown"),
    }

    Ok(())
}
