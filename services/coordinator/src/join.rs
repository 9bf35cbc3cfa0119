//! Join coordinator.
//!
//! Issues single-use join tokens and admits new members that redeem them.
//!
//! A token travels as base64 of its JSON form and carries a 32-byte random
//! secret, the addresses of the online members, the cluster certificate
//! fingerprint and its expiry. The store keeps only the SHA-256 of the secret,
//! keyed by server name, so issuing a new token for a name replaces the old
//! one.
//!
//! Redemption consumes the token and adds the member in one commit, which
//! makes it at-most-once even under concurrent redeemers.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use drover_events::{
    event_types, AggregateType, MemberRole, MemberStatus, TokenIssuedPayload,
    TokenRedeemedPayload, TokenRevokedPayload,
};
use drover_id::{MemberId, TokenId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::events::EventBus;
use crate::membership::{new_member, validate_name, MemberSpec, Membership};
use crate::network::{parse_address, NetworkResolver};
use crate::store::{ClusterSnapshot, Mutation, Resources, StoreHandle, TokenRecord};

/// Secret size (32 bytes = 256 bits of entropy).
const SECRET_BYTES: usize = 32;

/// Join tuning.
#[derive(Debug, Clone)]
pub struct JoinSettings {
    pub token_expiry: Duration,
    /// Bound on the liveness probe and on the initial state replication.
    pub join_timeout: Duration,
    pub cluster_fingerprint: String,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            token_expiry: Duration::from_secs(3 * 60 * 60),
            join_timeout: Duration::from_secs(30),
            cluster_fingerprint: String::new(),
        }
    }
}

/// Transport form of a join token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    pub server_name: String,
    pub secret: String,
    pub fingerprint: String,
    pub addresses: Vec<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_fingerprint: Option<String>,
}

impl JoinToken {
    pub fn encode(&self) -> ClusterResult<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ClusterError::InvalidRequest(format!("cannot encode token: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(encoded: &str) -> ClusterResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| ClusterError::InvalidToken("token is not valid base64".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| ClusterError::InvalidToken("token is malformed".to_string()))
    }
}

/// Hashes a token secret for storage.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Checks a presented secret against a stored hash. The digests are compared
/// without stopping at the first differing byte.
fn secret_matches(stored_hash: &str, secret: &str) -> bool {
    let Ok(stored) = hex::decode(stored_hash) else {
        return false;
    };
    let presented = Sha256::digest(secret.as_bytes());
    stored.len() == presented.len()
        && stored
            .iter()
            .zip(presented.iter())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A freshly issued token. The secret is only ever returned here.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub id: TokenId,
    pub token: JoinToken,
    pub encoded: String,
}

/// Metadata of a live token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub id: TokenId,
    pub server_name: String,
    pub issued_by: MemberId,
    pub expires_at: DateTime<Utc>,
    pub pinned: bool,
    pub expired: bool,
}

/// What a new member presents to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub token: String,
    pub address: String,
    pub fingerprint: String,
    #[serde(default)]
    pub capacity: Resources,
}

/// What the new member learns on admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipGrant {
    pub member_id: MemberId,
    pub name: String,
    pub role: MemberRole,
    pub groups: Vec<String>,
    pub cluster_fingerprint: String,
    pub addresses: Vec<String>,
}

fn online_addresses(snapshot: &ClusterSnapshot) -> Vec<String> {
    let mut members: Vec<_> = snapshot
        .members
        .values()
        .filter(|m| m.status == MemberStatus::Online)
        .collect();
    members.sort_by(|a, b| a.name.cmp(&b.name));
    members.into_iter().map(|m| m.address.clone()).collect()
}

/// Checks `token` against the live record for its server name.
fn verify<'a>(
    snapshot: &'a ClusterSnapshot,
    token: &JoinToken,
    now: DateTime<Utc>,
) -> ClusterResult<&'a TokenRecord> {
    let record = snapshot
        .tokens
        .get(&token.server_name)
        .ok_or_else(|| ClusterError::InvalidToken("token is unknown or already used".to_string()))?;
    if !secret_matches(&record.secret_hash, &token.secret) {
        return Err(ClusterError::InvalidToken(
            "token is unknown or already used".to_string(),
        ));
    }
    if record.is_expired(now) {
        return Err(ClusterError::InvalidToken("token has expired".to_string()));
    }
    Ok(record)
}

/// Issues and redeems join tokens.
#[derive(Clone)]
pub struct JoinCoordinator {
    store: StoreHandle,
    membership: Membership,
    network: Arc<dyn NetworkResolver>,
    events: EventBus,
    settings: JoinSettings,
}

impl JoinCoordinator {
    pub fn new(
        store: StoreHandle,
        membership: Membership,
        network: Arc<dyn NetworkResolver>,
        events: EventBus,
        settings: JoinSettings,
    ) -> Self {
        Self {
            store,
            membership,
            network,
            events,
            settings,
        }
    }

    /// Issues a token for `server_name`, replacing any live one.
    #[instrument(skip(self, pinned_fingerprint))]
    pub async fn issue_token(
        &self,
        requester: &str,
        server_name: &str,
        pinned_fingerprint: Option<String>,
    ) -> ClusterResult<IssuedToken> {
        validate_name("member", server_name)?;
        let secret = generate_secret();
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.settings.token_expiry)
                .unwrap_or(chrono::Duration::hours(3));
        let pinned = pinned_fingerprint.map(|f| f.trim().to_ascii_lowercase());

        let (record, token) = self
            .store
            .transact(|snapshot| {
                let issuer = snapshot
                    .member_by_name(requester)
                    .ok_or_else(|| ClusterError::NotClusterMember(requester.to_string()))?;
                if snapshot.member_by_name(server_name).is_some() {
                    return Err(ClusterError::DuplicateName(server_name.to_string()));
                }

                let record = TokenRecord {
                    id: TokenId::new(),
                    server_name: server_name.to_string(),
                    secret_hash: hash_secret(&secret),
                    issued_by: issuer.id,
                    pinned_fingerprint: pinned.clone(),
                    created_at: now,
                    expires_at,
                };
                let token = JoinToken {
                    server_name: server_name.to_string(),
                    secret: secret.clone(),
                    fingerprint: self.settings.cluster_fingerprint.clone(),
                    addresses: online_addresses(snapshot),
                    expires_at,
                    pinned_fingerprint: pinned.clone(),
                };
                Ok((vec![Mutation::PutToken(record.clone())], (record, token)))
            })
            .await?;

        info!(token_id = %record.id, %expires_at, "Issued join token");
        self.events.publish(
            AggregateType::Token,
            record.id.to_string(),
            event_types::TOKEN_ISSUED,
            &TokenIssuedPayload {
                token_id: record.id,
                server_name: record.server_name.clone(),
                issued_by: record.issued_by,
                expires_at,
            },
            None,
        );

        let encoded = token.encode()?;
        Ok(IssuedToken {
            id: record.id,
            token,
            encoded,
        })
    }

    /// Admits the member named in the token.
    #[instrument(skip(self, request), fields(address = %request.address))]
    pub async fn redeem_token(&self, request: JoinRequest) -> ClusterResult<MembershipGrant> {
        let token = JoinToken::decode(&request.token)?;
        if token.fingerprint != self.settings.cluster_fingerprint {
            return Err(ClusterError::InvalidToken(
                "token was issued by a different cluster".to_string(),
            ));
        }

        let fingerprint = request.fingerprint.trim().to_ascii_lowercase();
        if fingerprint.is_empty() {
            return Err(ClusterError::UntrustedCertificate(
                "no certificate fingerprint presented".to_string(),
            ));
        }

        let snapshot = self.store.read().await?;
        let record = verify(&snapshot, &token, Utc::now())?;
        if let Some(pin) = &record.pinned_fingerprint {
            if !pin.eq_ignore_ascii_case(&fingerprint) {
                return Err(ClusterError::UntrustedCertificate(
                    "certificate does not match the pinned fingerprint".to_string(),
                ));
            }
        }
        if let Some(existing) = snapshot.member_by_fingerprint(&fingerprint) {
            return Err(ClusterError::UntrustedCertificate(format!(
                "certificate already belongs to {}",
                existing.name
            )));
        }
        let token_id = record.id;

        let address = parse_address(&request.address).map_err(|e| ClusterError::InvalidAddress {
            address: request.address.clone(),
            reason: e.to_string(),
        })?;
        let probe = tokio::time::timeout(self.settings.join_timeout, self.network.probe(&address)).await;
        match probe {
            Err(_) => {
                return Err(ClusterError::JoinTimeout(format!(
                    "{address} did not answer within {:?}",
                    self.settings.join_timeout
                )))
            }
            Ok(Err(e)) => {
                return Err(ClusterError::InvalidAddress {
                    address,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(())) => {}
        }

        let spec = MemberSpec {
            name: token.server_name.clone(),
            address: address.clone(),
            capacity: request.capacity,
            fingerprint: Some(fingerprint.clone()),
        };
        let settings = *self.membership.settings();
        let member = self
            .store
            .transact(|snapshot| {
                let record = verify(snapshot, &token, Utc::now())?;
                if record.id != token_id {
                    return Err(ClusterError::InvalidToken(
                        "token was replaced".to_string(),
                    ));
                }
                if snapshot.member_by_name(&spec.name).is_some() {
                    return Err(ClusterError::DuplicateName(spec.name.clone()));
                }
                if snapshot.member_by_fingerprint(&fingerprint).is_some() {
                    return Err(ClusterError::UntrustedCertificate(
                        "certificate already in use".to_string(),
                    ));
                }

                let member = new_member(
                    snapshot,
                    &spec,
                    address.clone(),
                    MemberStatus::Joining,
                    &settings,
                );
                Ok((
                    vec![
                        Mutation::DeleteToken(token.server_name.clone()),
                        Mutation::PutMember(member.clone()),
                    ],
                    member,
                ))
            })
            .await?;

        info!(member_id = %member.id, name = %member.name, %token_id, "Join token redeemed");
        self.events.publish(
            AggregateType::Token,
            token_id.to_string(),
            event_types::TOKEN_REDEEMED,
            &TokenRedeemedPayload {
                token_id,
                server_name: member.name.clone(),
                member_id: member.id,
            },
            None,
        );

        let state = self.store.read().await?;
        let replicated = tokio::time::timeout(
            self.settings.join_timeout,
            self.network.replicate(&address, &state),
        )
        .await;
        let failure = match replicated {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "state replication exceeded {:?}",
                self.settings.join_timeout
            )),
        };
        if let Some(reason) = failure {
            warn!(member_id = %member.id, %reason, "Join failed after token was consumed");
            self.membership.discard(&member.id).await?;
            return Err(ClusterError::JoinTimeout(reason));
        }

        let (member, _) = self
            .membership
            .transition(&member.id, &[MemberStatus::Joining], MemberStatus::Online)
            .await?;
        self.membership.publish_joined(&member, Some(token_id));

        let addresses = online_addresses(&self.store.read().await?);
        Ok(MembershipGrant {
            member_id: member.id,
            name: member.name,
            role: member.role,
            groups: member.groups.into_iter().collect(),
            cluster_fingerprint: self.settings.cluster_fingerprint.clone(),
            addresses,
        })
    }

    pub async fn list_tokens(&self) -> ClusterResult<Vec<TokenInfo>> {
        let now = Utc::now();
        Ok(self
            .store
            .read()
            .await?
            .tokens
            .into_values()
            .map(|t| TokenInfo {
                id: t.id,
                expired: t.is_expired(now),
                pinned: t.pinned_fingerprint.is_some(),
                server_name: t.server_name,
                issued_by: t.issued_by,
                expires_at: t.expires_at,
            })
            .collect())
    }

    /// Invalidates the live token for `server_name`.
    pub async fn revoke_token(&self, server_name: &str) -> ClusterResult<TokenId> {
        let token_id = self
            .store
            .transact(|snapshot| {
                let record = snapshot.tokens.get(server_name).ok_or_else(|| {
                    ClusterError::InvalidToken(format!("no live token for {server_name}"))
                })?;
                Ok((vec![Mutation::DeleteToken(server_name.to_string())], record.id))
            })
            .await?;

        info!(%token_id, server_name, "Revoked join token");
        self.events.publish(
            AggregateType::Token,
            token_id.to_string(),
            event_types::TOKEN_REVOKED,
            &TokenRevokedPayload {
                token_id,
                server_name: server_name.to_string(),
            },
            None,
        );
        Ok(token_id)
    }

    /// Deletes expired tokens. Returns how many were removed.
    pub async fn prune_expired_tokens(&self, now: DateTime<Utc>) -> ClusterResult<usize> {
        self.store
            .transact(|snapshot| {
                let mutations: Vec<Mutation> = snapshot
                    .tokens
                    .values()
                    .filter(|t| t.is_expired(now))
                    .map(|t| Mutation::DeleteToken(t.server_name.clone()))
                    .collect();
                let count = mutations.len();
                Ok((mutations, count))
            })
            .await
    }
}
