//! Network collaborator: name resolution, liveness probes, reachability and
//! initial state replication to joining members.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{ClusterSnapshot, Member};

/// Errors from network calls.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("cannot resolve member {0}")]
    Unresolvable(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("{address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("replication to {address} failed: {reason}")]
    Replication { address: String, reason: String },
}

/// Network/DNS subsystem interface.
#[async_trait]
pub trait NetworkResolver: Send + Sync {
    /// Resolves a member name to its current `host:port` address.
    async fn resolve(&self, member_name: &str) -> Result<String, NetworkError>;

    /// Checks that something is listening at `address`.
    async fn probe(&self, address: &str) -> Result<(), NetworkError>;

    /// True if `from` can open a connection to `to`.
    async fn reachable(&self, from: &str, to: &str) -> bool;

    /// Pushes the initial cluster state to a newly admitted member.
    async fn replicate(&self, address: &str, snapshot: &ClusterSnapshot) -> Result<(), NetworkError>;
}

/// Validates a `host:port` address and returns it in normalized form.
pub fn parse_address(address: &str) -> Result<String, NetworkError> {
    let invalid = |reason: &str| NetworkError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(invalid("address is empty"));
    }

    if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(invalid("port must be non-zero"));
        }
        return Ok(addr.to_string());
    }

    let (host, port) = trimmed
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;

    let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
    if port == 0 {
        return Err(invalid("port must be non-zero"));
    }

    let valid_host = !host.is_empty()
        && host.len() <= 253
        && host
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && !label.starts_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
    if !valid_host {
        return Err(invalid("host is not a valid name or IP"));
    }

    Ok(format!("{}:{port}", host.to_ascii_lowercase()))
}

/// Address to use for `member`: resolved by name, falling back to the stored address.
pub async fn endpoint(network: &dyn NetworkResolver, member: &Member) -> String {
    match network.resolve(&member.name).await {
        Ok(address) => address,
        Err(e) => {
            debug!(member = %member.name, error = %e, "Falling back to stored member address");
            member.address.clone()
        }
    }
}

#[derive(Default)]
struct StaticNetworkState {
    names: HashMap<String, String>,
    down: HashSet<String>,
    blocked: HashSet<(String, String)>,
    probe_delay: Option<Duration>,
    replicate_delay: Option<Duration>,
    replicated: Vec<(String, u64)>,
}

/// In-memory network for tests and dev mode.
///
/// Every address is reachable and alive unless marked otherwise.
#[derive(Default)]
pub struct StaticNetwork {
    state: Mutex<StaticNetworkState>,
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StaticNetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, name: &str, address: &str) {
        self.state()
            .names
            .insert(name.to_string(), address.to_string());
    }

    /// Marks `address` as dead (probes and replication fail, nothing reaches it).
    pub fn set_down(&self, address: &str, down: bool) {
        let mut state = self.state();
        if down {
            state.down.insert(address.to_string());
        } else {
            state.down.remove(address);
        }
    }

    /// Blocks connections opened from `from` to `to` (one direction only).
    pub fn block(&self, from: &str, to: &str) {
        self.state()
            .blocked
            .insert((from.to_string(), to.to_string()));
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.state().probe_delay = Some(delay);
    }

    pub fn set_replicate_delay(&self, delay: Duration) {
        self.state().replicate_delay = Some(delay);
    }

    /// Addresses that received a replication, with the revision they got.
    pub fn replications(&self) -> Vec<(String, u64)> {
        self.state().replicated.clone()
    }
}

#[async_trait]
impl NetworkResolver for StaticNetwork {
    async fn resolve(&self, member_name: &str) -> Result<String, NetworkError> {
        self.state()
            .names
            .get(member_name)
            .cloned()
            .ok_or_else(|| NetworkError::Unresolvable(member_name.to_string()))
    }

    async fn probe(&self, address: &str) -> Result<(), NetworkError> {
        let delay = self.state().probe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state().down.contains(address) {
            return Err(NetworkError::Unreachable {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn reachable(&self, from: &str, to: &str) -> bool {
        let state = self.state();
        !state.down.contains(to) && !state.blocked.contains(&(from.to_string(), to.to_string()))
    }

    async fn replicate(&self, address: &str, snapshot: &ClusterSnapshot) -> Result<(), NetworkError> {
        let delay = self.state().replicate_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.down.contains(address) {
            return Err(NetworkError::Replication {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state
            .replicated
            .push((address.to_string(), snapshot.revision));
        info!(%address, revision = snapshot.revision, "[MOCK] Replicated cluster state");
        Ok(())
    }
}
