//! Coordinator configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file named by
//! `DROVER_CONFIG`, then `DROVER_*` environment variables
//! (`DROVER_LISTEN_ADDR`, `DROVER_TOLERATE_FAILURES`, ...).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Environment, File};
use drover_events::TransferMode;
use serde::Deserialize;

use crate::cluster::ClusterSettings;
use crate::evacuation::EvacuationSettings;
use crate::join::JoinSettings;
use crate::membership::{MemberSpec, MembershipSettings};
use crate::migration::TransferSettings;
use crate::placement::{PlacementPolicy, PlacementSettings, ScoreWeights};
use crate::store::Resources;

const ENV_PREFIX: &str = "DROVER";
const CONFIG_FILE_VAR: &str = "DROVER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// SQLite database file. In-memory state when unset.
    pub database_path: Option<PathBuf>,

    pub member_name: String,
    pub member_address: String,
    pub member_cpu_millis: u64,
    pub member_memory_bytes: u64,
    pub member_fingerprint: Option<String>,
    /// Derived from the member identity when empty.
    pub cluster_fingerprint: String,

    pub heartbeat_interval_secs: u64,
    pub max_missed_heartbeats: u32,
    pub max_voters: usize,
    pub max_standby: usize,

    pub token_expiry_secs: u64,
    pub join_timeout_secs: u64,

    pub placement_policy: PlacementPolicy,
    pub cpu_weight: f64,
    pub memory_weight: f64,

    pub evacuation_concurrency: usize,
    pub tolerate_failures: bool,
    pub return_migrated: bool,
    /// Seconds offline before a member is evacuated automatically; 0 disables.
    pub healing_threshold_secs: u64,

    pub precopy_goal: f64,
    pub precopy_max_iterations: u32,
    pub chunk_size: usize,
    pub relay_buffer: usize,
    pub transfer_mode: Option<TransferMode>,
}

impl Default for Config {
    fn default() -> Self {
        let membership = MembershipSettings::default();
        let join = JoinSettings::default();
        let evacuation = EvacuationSettings::default();
        let transfer = TransferSettings::default();
        let weights = ScoreWeights::default();

        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8443)),
            log_level: "info".to_string(),
            database_path: None,
            member_name: "coordinator".to_string(),
            member_address: "127.0.0.1:8443".to_string(),
            member_cpu_millis: 4000,
            member_memory_bytes: 8 << 30,
            member_fingerprint: None,
            cluster_fingerprint: String::new(),
            heartbeat_interval_secs: membership.heartbeat_interval.as_secs(),
            max_missed_heartbeats: membership.max_missed_heartbeats,
            max_voters: membership.max_voters,
            max_standby: membership.max_standby,
            token_expiry_secs: join.token_expiry.as_secs(),
            join_timeout_secs: join.join_timeout.as_secs(),
            placement_policy: PlacementPolicy::default(),
            cpu_weight: weights.cpu,
            memory_weight: weights.memory,
            evacuation_concurrency: evacuation.concurrency,
            tolerate_failures: evacuation.tolerate_failures,
            return_migrated: evacuation.return_migrated,
            healing_threshold_secs: evacuation.healing_threshold.as_secs(),
            precopy_goal: transfer.precopy_goal,
            precopy_max_iterations: transfer.precopy_max_iterations,
            chunk_size: transfer.chunk_size,
            relay_buffer: transfer.relay_buffer,
            transfer_mode: transfer.preferred_mode,
        }
    }
}

impl Config {
    /// Loads from `DROVER_CONFIG` (if set) and the process environment.
    pub fn from_env() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_VAR).ok().map(PathBuf::from);
        Self::load(file.as_deref(), Environment::with_prefix(ENV_PREFIX))
    }

    /// Loads from an optional file and the given environment source.
    pub fn load(file: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(env.try_parsing(true))
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.precopy_goal) {
            anyhow::bail!("precopy_goal must be between 0 and 1");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be positive");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        Ok(())
    }

    /// Identity of the coordinator's own member.
    pub fn member_spec(&self) -> MemberSpec {
        MemberSpec {
            name: self.member_name.clone(),
            address: self.member_address.clone(),
            capacity: Resources::new(self.member_cpu_millis, self.member_memory_bytes),
            fingerprint: self.member_fingerprint.clone(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Healing never starts before a member could have been marked offline.
    pub fn healing_threshold(&self, membership: &MembershipSettings) -> Duration {
        match self.healing_threshold_secs {
            0 => Duration::ZERO,
            secs => Duration::from_secs(secs).max(membership.offline_threshold()),
        }
    }

    pub fn settings(&self) -> ClusterSettings {
        let membership = MembershipSettings {
            max_voters: self.max_voters,
            max_standby: self.max_standby,
            heartbeat_interval: self.heartbeat_interval(),
            max_missed_heartbeats: self.max_missed_heartbeats,
        };
        let healing_threshold = self.healing_threshold(&membership);
        ClusterSettings {
            membership,
            join: JoinSettings {
                token_expiry: Duration::from_secs(self.token_expiry_secs),
                join_timeout: Duration::from_secs(self.join_timeout_secs),
                cluster_fingerprint: self.cluster_fingerprint.clone(),
            },
            placement: PlacementSettings {
                policy: self.placement_policy,
                weights: ScoreWeights {
                    cpu: self.cpu_weight,
                    memory: self.memory_weight,
                },
            },
            evacuation: EvacuationSettings {
                concurrency: self.evacuation_concurrency.max(1),
                tolerate_failures: self.tolerate_failures,
                return_migrated: self.return_migrated,
                healing_threshold,
            },
            transfer: TransferSettings {
                chunk_size: self.chunk_size,
                relay_buffer: self.relay_buffer.max(1),
                precopy_goal: self.precopy_goal,
                precopy_max_iterations: self.precopy_max_iterations,
                preferred_mode: self.transfer_mode,
            },
        }
    }
}
