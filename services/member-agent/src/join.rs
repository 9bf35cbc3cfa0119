//! Cluster admission on startup.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::client::{Capacity, CoordinatorClient, JoinRequest};
use crate::config::Config;

/// How the agent ended up a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Already known to the coordinator from an earlier run.
    Existing { name: String },
    /// Redeemed the configured token just now.
    Joined {
        name: String,
        cluster_fingerprint: String,
    },
}

impl Admission {
    pub fn name(&self) -> &str {
        match self {
            Self::Existing { name } | Self::Joined { name, .. } => name,
        }
    }
}

/// Makes sure this member belongs to the cluster, redeeming the join token
/// when the coordinator does not know it yet.
pub async fn ensure_joined(client: &CoordinatorClient, config: &Config) -> Result<Admission> {
    match client.get_member(&config.member_name).await {
        Ok(member) => {
            info!(
                member_id = %member.id,
                name = %member.name,
                status = %member.status,
                "Member already registered"
            );
            return Ok(Admission::Existing { name: member.name });
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e).context("failed to look up member"),
    }

    let token = config
        .join_token
        .clone()
        .context("member is not registered and no DROVER_AGENT_JOIN_TOKEN is set")?;

    let request = JoinRequest {
        token,
        address: config.address.clone(),
        fingerprint: config.fingerprint.clone(),
        capacity: Capacity {
            cpu_millis: config.cpu_millis,
            memory_bytes: config.memory_bytes,
        },
    };
    let grant = client
        .join(&request)
        .await
        .context("failed to redeem join token")?;

    if grant.name != config.member_name {
        warn!(
            configured = %config.member_name,
            granted = %grant.name,
            "Token was issued for a different name, using the granted one"
        );
    }
    info!(
        member_id = %grant.member_id,
        name = %grant.name,
        role = %grant.role,
        operation_id = %grant.operation_id,
        peers = grant.addresses.len(),
        "Joined cluster"
    );

    Ok(Admission::Joined {
        name: grant.name,
        cluster_fingerprint: grant.cluster_fingerprint,
    })
}
