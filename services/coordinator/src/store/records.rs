//! Records held by the cluster store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use drover_events::{
    EvacuatePolicy, MemberRole, MemberStatus, PowerState, ResourceKind, SchedulerMode,
};
use drover_id::{MemberId, ResourceId, TokenId};
use serde::{Deserialize, Serialize};

/// Name of the group every member starts in. It cannot be deleted or renamed.
pub const DEFAULT_GROUP: &str = "default";

/// CPU and memory amounts, used for capacity, load and requirements alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu_millis: 0,
        memory_bytes: 0,
    };

    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }

    /// True if every dimension of `self` is at most the matching one of `limit`.
    pub fn fits_within(&self, limit: &Resources) -> bool {
        self.cpu_millis <= limit.cpu_millis && self.memory_bytes <= limit.memory_bytes
    }
}

/// A host participating in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    pub address: String,
    pub role: MemberRole,
    pub status: MemberStatus,
    pub groups: BTreeSet<String>,
    pub scheduler_mode: SchedulerMode,
    pub capacity: Resources,
    /// Sum of the requirements of hosted resources plus inbound migration reservations.
    pub load: Resources,
    pub resource_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    /// True if the member can take `demand` on top of its current load.
    pub fn has_room_for(&self, demand: &Resources) -> bool {
        self.load.saturating_add(demand).fits_within(&self.capacity)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// A named set of members used to scope placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Project-level placement settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub default_group: String,
}

/// A storage pool. Volumes on remote pools are not bound to a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub remote: bool,
}

/// Persisted metadata of a live join token. The secret is kept only as a hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: TokenId,
    pub server_name: String,
    pub secret_hash: String,
    pub issued_by: MemberId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Where a placement should land.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum TargetScope {
    /// Let the scorer choose among members in scheduler mode `all`.
    #[default]
    Any,
    /// A specific member, by name.
    Member(String),
    /// Any member of the named group.
    Group(String),
}

impl TargetScope {
    /// Parses the `target` form: empty for any, `@group` for a group, otherwise a member name.
    pub fn parse(target: Option<&str>) -> TargetScope {
        match target.map(str::trim) {
            None | Some("") => TargetScope::Any,
            Some(t) => match t.strip_prefix('@') {
                Some(group) => TargetScope::Group(group.to_string()),
                None => TargetScope::Member(t.to_string()),
            },
        }
    }
}

impl std::fmt::Display for TargetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetScope::Any => f.write_str("any"),
            TargetScope::Member(name) => f.write_str(name),
            TargetScope::Group(group) => write!(f, "@{group}"),
        }
    }
}

/// Inputs that decide whether an instance can be live-migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LiveMigrationProfile {
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub state_storage_bytes: u64,
    #[serde(default)]
    pub resident_memory_bytes: u64,
}

impl LiveMigrationProfile {
    pub fn is_eligible(&self) -> bool {
        self.stateful && self.state_storage_bytes >= self.resident_memory_bytes
    }
}

/// What an evacuation did to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvacuationAction {
    Stopped,
    Frozen,
    Migrated,
    LiveMigrated,
    /// Nothing had to be done (not running, or a volume in a stop/freeze evacuation).
    LeftInPlace,
}

/// Marker recorded on a resource touched by an evacuation, consumed by restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvacuationMark {
    pub origin: MemberId,
    pub action: EvacuationAction,
    pub prior_power: PowerState,
}

impl EvacuationMark {
    /// Whether a resource still on its origin in `power` is as this mark left it.
    pub fn still_applies(&self, power: PowerState) -> bool {
        match self.action {
            EvacuationAction::Stopped => power == PowerState::Stopped,
            EvacuationAction::Frozen => power == PowerState::Frozen,
            EvacuationAction::LeftInPlace => power == self.prior_power,
            EvacuationAction::Migrated | EvacuationAction::LiveMigrated => false,
        }
    }
}

/// A placed instance or volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub project: String,
    pub kind: ResourceKind,
    /// `None` only for volumes on remote pools.
    pub host: Option<MemberId>,
    pub requirements: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    pub power_state: PowerState,
    #[serde(default)]
    pub live_migration: LiveMigrationProfile,
    /// Applied when the host is evacuated in `auto` mode.
    #[serde(default)]
    pub evacuate_policy: EvacuatePolicy,
    /// Scope the resource was originally placed with.
    #[serde(default)]
    pub scope: TargetScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evacuation: Option<EvacuationMark>,
    /// Member holding a capacity reservation while a migration is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_target: Option<MemberId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn is_running(&self) -> bool {
        self.power_state == PowerState::Running
    }
}

/// A consistent copy of the whole cluster state at one revision.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub revision: u64,
    pub members: BTreeMap<MemberId, Member>,
    pub groups: BTreeMap<String, Group>,
    pub projects: BTreeMap<String, Project>,
    pub pools: BTreeMap<String, StoragePool>,
    /// Live join tokens keyed by server name.
    pub tokens: BTreeMap<String, TokenRecord>,
    pub resources: BTreeMap<ResourceId, Resource>,
}

impl ClusterSnapshot {
    /// An empty cluster holding only the default group.
    pub fn seeded() -> Self {
        let mut snapshot = Self::default();
        snapshot.groups.insert(
            DEFAULT_GROUP.to_string(),
            Group {
                name: DEFAULT_GROUP.to_string(),
                description: "Default cluster group".to_string(),
            },
        );
        snapshot
    }

    pub fn member_by_name(&self, name: &str) -> Option<&Member> {
        self.members.values().find(|m| m.name == name)
    }

    pub fn member_by_fingerprint(&self, fingerprint: &str) -> Option<&Member> {
        self.members.values().find(|m| {
            m.fingerprint
                .as_deref()
                .is_some_and(|f| f.eq_ignore_ascii_case(fingerprint))
        })
    }

    /// Resources whose current host is `member`.
    pub fn hosted_resources<'a>(&'a self, member: &'a MemberId) -> impl Iterator<Item = &'a Resource> {
        self.resources
            .values()
            .filter(move |r| r.host.as_ref() == Some(member))
    }

    /// Resources holding an inbound migration reservation on `member`.
    pub fn inbound_resources<'a>(
        &'a self,
        member: &'a MemberId,
    ) -> impl Iterator<Item = &'a Resource> {
        self.resources
            .values()
            .filter(move |r| r.migration_target.as_ref() == Some(member))
    }

    /// The default group of a project, falling back to `default` for unknown projects.
    pub fn project_group(&self, project: &str) -> &str {
        self.projects
            .get(project)
            .map(|p| p.default_group.as_str())
            .unwrap_or(DEFAULT_GROUP)
    }

    pub fn resource_by_name(&self, project: &str, kind: ResourceKind, name: &str) -> Option<&Resource> {
        self.resources
            .values()
            .find(|r| r.project == project && r.kind == kind && r.name == name)
    }

    /// Applies one mutation in place. Used by the in-memory backend and by tests.
    pub fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::PutMember(m) => {
                self.members.insert(m.id, m);
            }
            Mutation::DeleteMember(id) => {
                self.members.remove(&id);
            }
            Mutation::PutGroup(g) => {
                self.groups.insert(g.name.clone(), g);
            }
            Mutation::DeleteGroup(name) => {
                self.groups.remove(&name);
            }
            Mutation::PutProject(p) => {
                self.projects.insert(p.name.clone(), p);
            }
            Mutation::PutPool(p) => {
                self.pools.insert(p.name.clone(), p);
            }
            Mutation::PutToken(t) => {
                self.tokens.insert(t.server_name.clone(), t);
            }
            Mutation::DeleteToken(server_name) => {
                self.tokens.remove(&server_name);
            }
            Mutation::PutResource(r) => {
                self.resources.insert(r.id, r);
            }
            Mutation::DeleteResource(id) => {
                self.resources.remove(&id);
            }
        }
    }
}

/// A single write in a commit batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    PutMember(Member),
    DeleteMember(MemberId),
    PutGroup(Group),
    DeleteGroup(String),
    PutProject(Project),
    PutPool(StoragePool),
    PutToken(TokenRecord),
    /// Removes the live token of a server name.
    DeleteToken(String),
    PutResource(Resource),
    DeleteResource(ResourceId),
}
