//! Background liveness sweeper.
//!
//! Each pass marks silent members offline, heals members that stayed offline
//! past the healing threshold and prunes expired join tokens.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::cluster::Cluster;
use crate::operations::{OperationKind, OperationStatus};

#[derive(Debug, Clone)]
pub struct HeartbeatSweeperConfig {
    pub interval: Duration,
    /// Member hosting this coordinator; it heartbeats itself on every pass.
    pub local_member: Option<String>,
}

impl Default for HeartbeatSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            local_member: None,
        }
    }
}

/// What a single pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub marked_offline: Vec<String>,
    /// Members an automatic evacuation ran for.
    pub healed: Vec<String>,
    pub tokens_pruned: usize,
}

pub struct HeartbeatSweeper {
    cluster: Cluster,
    config: HeartbeatSweeperConfig,
}

impl HeartbeatSweeper {
    pub fn new(cluster: Cluster, config: HeartbeatSweeperConfig) -> Self {
        Self { cluster, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            local_member = ?self.config.local_member,
            "Starting heartbeat sweeper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Runs one pass as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let membership = self.cluster.membership();

        if let Some(name) = &self.config.local_member {
            if let Err(e) = membership.heartbeat(name, Default::default()).await {
                warn!(member = %name, error = %e, "Failed to record local heartbeat");
            }
        }

        match membership.sweep_offline(now).await {
            Ok(members) => {
                for member in &members {
                    warn!(member = %member.name, "Member missed heartbeats, marked offline");
                }
                summary.marked_offline = members.into_iter().map(|m| m.name).collect();
            }
            Err(e) => {
                error!(error = %e, "Failed to sweep member liveness");
            }
        }

        let threshold = self.cluster.orchestrator().settings().healing_threshold;
        if !threshold.is_zero() {
            summary.healed = self.heal(now, threshold).await;
        }

        match self.cluster.join().prune_expired_tokens(now).await {
            Ok(count) => {
                if count > 0 {
                    info!(pruned = count, "Pruned expired join tokens");
                }
                summary.tokens_pruned = count;
            }
            Err(e) => {
                warn!(error = %e, "Failed to prune join tokens");
            }
        }

        summary
    }

    async fn heal(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        let candidates = match self
            .cluster
            .membership()
            .healing_candidates(now, threshold)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Failed to list members to heal");
                return Vec::new();
            }
        };

        let operations = self.cluster.operations();
        let mut healed = Vec::new();
        for member in candidates {
            warn!(member = %member.name, "Member offline past healing threshold, evacuating");
            let orchestrator = self.cluster.orchestrator().clone();
            let name = member.name.clone();
            let id = operations
                .spawn(OperationKind::Heal, &member.name, move |id, cancel| async move {
                    orchestrator.heal(&name, Some(id), &cancel).await
                })
                .await;

            match operations.wait(&id).await {
                Some(op) if op.status == OperationStatus::Succeeded => healed.push(member.name),
                Some(op) => {
                    error!(member = %member.name, operation_id = %id, status = ?op.status, "Failed to heal member");
                }
                None => {}
            }
        }
        healed
    }
}
