//! Coordinator API client for the member agent.

use std::time::Duration;

use drover_events::{MemberRole, MemberStatus};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::Config;

/// Errors talking to the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The coordinator answered with a problem document.
    #[error("{status} {code}: {detail}")]
    Problem {
        status: StatusCode,
        code: String,
        detail: String,
    },
}

impl ClientError {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Problem { code, .. } => Some(code),
            Self::Http(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Problem { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Deserialize)]
struct ProblemBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    detail: String,
}

/// Coordinator API client.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    client: reqwest::Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: config.coordinator_url.trim_end_matches('/').to_string(),
        })
    }

    /// Looks up a member by name.
    pub async fn get_member(&self, name: &str) -> Result<MemberInfo, ClientError> {
        let url = format!("{}/v1/members/{name}", self.base_url);
        debug!(url = %url, "Fetching member");
        let response = self.client.get(&url).send().await?;
        decode(response).await
    }

    /// Redeems a join token.
    pub async fn join(&self, request: &JoinRequest) -> Result<JoinGrant, ClientError> {
        let url = format!("{}/v1/cluster/join", self.base_url);
        debug!(address = %request.address, "Redeeming join token");
        let response = self.client.post(&url).json(request).send().await?;
        decode(response).await
    }

    /// Sends a heartbeat for `name`.
    pub async fn send_heartbeat(
        &self,
        name: &str,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, ClientError> {
        let url = format!("{}/v1/members/{name}/heartbeat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let problem: ProblemBody = serde_json::from_str(&body).unwrap_or(ProblemBody {
        code: "unknown".to_string(),
        detail: body,
    });
    error!(status = %status, code = %problem.code, detail = %problem.detail, "Coordinator rejected request");
    Err(ClientError::Problem {
        status,
        code: problem.code,
        detail: problem.detail,
    })
}

/// CPU and memory amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

/// Join request sent with a token.
#[derive(Debug, Serialize)]
pub struct JoinRequest {
    pub token: String,
    pub address: String,
    pub fingerprint: String,
    pub capacity: Capacity,
}

/// What the coordinator hands back after a successful join.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinGrant {
    pub operation_id: String,
    pub member_id: String,
    pub name: String,
    pub role: MemberRole,
    #[serde(default)]
    pub groups: Vec<String>,
    pub cluster_fingerprint: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Subset of a member record the agent cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberInfo {
    pub id: String,
    pub name: String,
    pub status: MemberStatus,
}

/// Heartbeat request.
#[derive(Debug, Serialize)]
pub struct HeartbeatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Capacity>,
    /// Set on the final heartbeat before the agent exits.
    pub shutting_down: bool,
}

/// Heartbeat response.
#[derive(Debug, Deserialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
    pub status: MemberStatus,
    pub next_heartbeat_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_request_serialization() {
        let request = HeartbeatRequest {
            capacity: None,
            shutting_down: true,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"shutting_down":true}"#);
    }

    #[test]
    fn test_grant_deserialization() {
        let json = r#"{
            "operation_id": "op_01HZYKX4MZ5ZQ2KQ2B70YH9F7T",
            "member_id": "mbr_01HZYKX4MZ5ZQ2KQ2B70YH9F7T",
            "name": "m2",
            "role": "voter",
            "groups": ["default"],
            "cluster_fingerprint": "ab12cd34",
            "addresses": ["10.0.0.1:8443"]
        }"#;
        let grant: JoinGrant = serde_json::from_str(json).unwrap();
        assert_eq!(grant.name, "m2");
        assert_eq!(grant.role, MemberRole::Voter);
        assert_eq!(grant.addresses.len(), 1);
    }
}
