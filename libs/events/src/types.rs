//! Event type names, payloads, and the cluster status enums they carry.

use chrono::{DateTime, Utc};
use drover_id::{MemberId, MigrationId, OperationId, ResourceId, TokenId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Member
    pub const MEMBER_JOINED: &str = "member.joined";
    pub const MEMBER_REMOVED: &str = "member.removed";
    pub const MEMBER_STATUS_CHANGED: &str = "member.status_changed";
    pub const MEMBER_ROLE_CHANGED: &str = "member.role_changed";
    pub const MEMBER_GROUPS_SET: &str = "member.groups_set";

    // Group
    pub const GROUP_CREATED: &str = "group.created";
    pub const GROUP_RENAMED: &str = "group.renamed";
    pub const GROUP_DELETED: &str = "group.deleted";

    // Join token
    pub const TOKEN_ISSUED: &str = "token.issued";
    pub const TOKEN_REDEEMED: &str = "token.redeemed";
    pub const TOKEN_REVOKED: &str = "token.revoked";

    // Resource
    pub const RESOURCE_PLACED: &str = "resource.placed";
    pub const RESOURCE_RELEASED: &str = "resource.released";
    pub const RESOURCE_MOVED: &str = "resource.moved";

    // Evacuation
    pub const EVACUATION_COMPLETED: &str = "evacuation.completed";
    pub const RESTORE_COMPLETED: &str = "restore.completed";

    // Migration
    pub const MIGRATION_STARTED: &str = "migration.started";
    pub const MIGRATION_FINISHED: &str = "migration.finished";
}

// =============================================================================
// Status Enums
// =============================================================================

/// Raft-style role of a member. A member holds exactly one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Voter,
    StandBy,
    Spare,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voter => "voter",
            Self::StandBy => "stand_by",
            Self::Spare => "spare",
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Admitted but not yet confirmed by a first heartbeat.
    Joining,
    Online,
    /// Missed too many heartbeats, or announced a shutdown.
    Offline,
    Evacuating,
    Evacuated,
    Restoring,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joining => "joining",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Evacuating => "evacuating",
            Self::Evacuated => "evacuated",
            Self::Restoring => "restoring",
        }
    }

    /// Only online members take new placements.
    pub fn accepts_placements(&self) -> bool {
        matches!(self, Self::Online)
    }

    /// True while an evacuation or restore owns the member's status.
    pub fn is_evacuation_state(&self) -> bool {
        matches!(self, Self::Evacuating | Self::Evacuated | Self::Restoring)
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-member opt-in to automatic placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Eligible for unconstrained and group-scoped placement.
    #[default]
    All,
    /// Eligible only when a placement targets one of the member's groups.
    Group,
    /// Only explicit member targets land here.
    Manual,
}

/// Kind of placed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    Volume,
}

/// Power state of a placed instance. Volumes are always `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    #[default]
    Stopped,
    Frozen,
}

/// What to do with the resources hosted on an evacuating member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvacuationMode {
    /// Follow each resource's [`EvacuatePolicy`].
    #[default]
    Auto,
    /// Stop every running resource in place.
    Stop,
    /// Freeze every running resource in place.
    Freeze,
    /// Cold-migrate every resource to another member.
    Migrate,
    /// Live-migrate eligible resources, stop the rest in place.
    LiveMigrate,
}

impl std::fmt::Display for EvacuationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Stop => "stop",
            Self::Freeze => "freeze",
            Self::Migrate => "migrate",
            Self::LiveMigrate => "live-migrate",
        };
        f.write_str(s)
    }
}

/// Per-resource choice applied by an `auto` evacuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvacuatePolicy {
    /// Live-migrate when eligible and running, otherwise cold-migrate.
    #[default]
    Auto,
    Migrate,
    LiveMigrate,
    Stop,
}

impl EvacuatePolicy {
    /// The mode an `auto` evacuation uses for a resource with this policy.
    pub fn resolve(self, live_capable: bool) -> EvacuationMode {
        match self {
            Self::Auto if live_capable => EvacuationMode::LiveMigrate,
            Self::Auto | Self::Migrate => EvacuationMode::Migrate,
            Self::LiveMigrate => EvacuationMode::LiveMigrate,
            Self::Stop => EvacuationMode::Stop,
        }
    }
}

/// Which side initiates a migration data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Target connects to the source and reads.
    #[default]
    Pull,
    /// Source connects to the target and writes.
    Push,
    /// The coordinator buffers between two members that cannot reach each other.
    Relay,
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Relay => "relay",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Member Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberJoinedPayload {
    pub member_id: MemberId,
    pub name: String,
    pub address: String,
    pub role: MemberRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<TokenId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRemovedPayload {
    pub member_id: MemberId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberStatusChangedPayload {
    pub member_id: MemberId,
    pub old_status: MemberStatus,
    pub new_status: MemberStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRoleChangedPayload {
    pub member_id: MemberId,
    pub old_role: MemberRole,
    pub new_role: MemberRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberGroupsSetPayload {
    pub member_id: MemberId,
    pub groups: Vec<String>,
}

// =============================================================================
// Group Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCreatedPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRenamedPayload {
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDeletedPayload {
    pub name: String,
    /// Members that lost the label. Their resources are not moved.
    pub members: Vec<MemberId>,
}

// =============================================================================
// Token Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenIssuedPayload {
    pub token_id: TokenId,
    pub server_name: String,
    pub issued_by: MemberId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRedeemedPayload {
    pub token_id: TokenId,
    pub server_name: String,
    pub member_id: MemberId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRevokedPayload {
    pub token_id: TokenId,
    pub server_name: String,
}

// =============================================================================
// Resource Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePlacedPayload {
    pub resource_id: ResourceId,
    pub name: String,
    pub project: String,
    /// `None` for volumes on remote storage pools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<MemberId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReleasedPayload {
    pub resource_id: ResourceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<MemberId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMovedPayload {
    pub resource_id: ResourceId,
    pub from_member: MemberId,
    pub to_member: MemberId,
    pub live: bool,
}

// =============================================================================
// Evacuation Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvacuationCompletedPayload {
    pub member_id: MemberId,
    pub mode: EvacuationMode,
    pub succeeded: usize,
    pub failed: usize,
    /// Final member status (`evacuated`, or `evacuating` if failures were not tolerated).
    pub member_status: MemberStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreCompletedPayload {
    pub member_id: MemberId,
    pub resumed: usize,
    pub returned: usize,
    pub failed: usize,
}

// =============================================================================
// Migration Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStartedPayload {
    pub migration_id: MigrationId,
    pub resource_id: ResourceId,
    pub source: MemberId,
    pub target: MemberId,
    pub mode: TransferMode,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationFinishedPayload {
    pub migration_id: MigrationId,
    pub resource_id: ResourceId,
    pub committed: bool,
    pub bytes_transferred: u64,
    pub precopy_iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
