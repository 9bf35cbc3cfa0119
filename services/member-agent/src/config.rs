//! Configuration for the member agent.

use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

const ENV_PREFIX: &str = "DROVER_AGENT_";

/// Member agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordinator API URL.
    pub coordinator_url: String,

    /// Name this member holds (or will take) in the cluster.
    pub member_name: String,

    /// Address other members reach this one on.
    pub address: String,

    /// Certificate fingerprint presented on join.
    pub fingerprint: String,

    /// Encoded join token. Only needed the first time a member comes up.
    pub join_token: Option<String>,

    pub cpu_millis: u64,
    pub memory_bytes: u64,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from `DROVER_AGENT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which receives the full
    /// variable name (`DROVER_AGENT_MEMBER_NAME`, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());
        let number = |name: &str, default: u64| -> Result<u64> {
            match var(name) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{ENV_PREFIX}{name} is not a number: {raw}")),
                None => Ok(default),
            }
        };

        let member_name = var("MEMBER_NAME").context("DROVER_AGENT_MEMBER_NAME is required")?;
        let address = var("ADDRESS").context("DROVER_AGENT_ADDRESS is required")?;
        let fingerprint = var("FINGERPRINT").unwrap_or_else(|| {
            hex::encode(Sha256::digest(format!("{member_name}@{address}")))
        });

        let heartbeat_interval_secs = number("HEARTBEAT_INTERVAL", 10)?;
        if heartbeat_interval_secs == 0 {
            anyhow::bail!("DROVER_AGENT_HEARTBEAT_INTERVAL must be positive");
        }

        Ok(Self {
            coordinator_url: var("COORDINATOR_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8443".to_string()),
            member_name,
            address,
            fingerprint,
            join_token: var("JOIN_TOKEN"),
            cpu_millis: number("CPU_MILLIS", 4000)?,
            memory_bytes: number("MEMORY_BYTES", 8 << 30)?,
            heartbeat_interval_secs,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[
            ("DROVER_AGENT_MEMBER_NAME", "m2"),
            ("DROVER_AGENT_ADDRESS", "10.0.0.2:8443"),
        ])
        .unwrap();
        assert_eq!(config.coordinator_url, "http://127.0.0.1:8443");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert!(config.join_token.is_none());
        // Derived fingerprint is a hex sha256
        assert_eq!(config.fingerprint.len(), 64);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DROVER_AGENT_MEMBER_NAME", "m2"),
            ("DROVER_AGENT_ADDRESS", "10.0.0.2:8443"),
            ("DROVER_AGENT_FINGERPRINT", "f2"),
            ("DROVER_AGENT_JOIN_TOKEN", "abc"),
            ("DROVER_AGENT_CPU_MILLIS", "2000"),
            ("DROVER_AGENT_HEARTBEAT_INTERVAL", "3"),
        ])
        .unwrap();
        assert_eq!(config.fingerprint, "f2");
        assert_eq!(config.join_token.as_deref(), Some("abc"));
        assert_eq!(config.cpu_millis, 2000);
        assert_eq!(config.heartbeat_interval_secs, 3);
    }

    #[rstest]
    #[case(&[("DROVER_AGENT_ADDRESS", "10.0.0.2:8443")])]
    #[case(&[("DROVER_AGENT_MEMBER_NAME", "m2")])]
    #[case(&[
        ("DROVER_AGENT_MEMBER_NAME", "m2"),
        ("DROVER_AGENT_ADDRESS", "10.0.0.2:8443"),
        ("DROVER_AGENT_CPU_MILLIS", "lots"),
    ])]
    #[case(&[
        ("DROVER_AGENT_MEMBER_NAME", "m2"),
        ("DROVER_AGENT_ADDRESS", "10.0.0.2:8443"),
        ("DROVER_AGENT_HEARTBEAT_INTERVAL", "0"),
    ])]
    fn test_rejects_invalid(#[case] vars: &[(&str, &str)]) {
        assert!(load(vars).is_err());
    }
}
