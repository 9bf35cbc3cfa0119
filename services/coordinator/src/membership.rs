//! Membership store.
//!
//! Owns member records, roles, groups and the liveness state machine:
//!
//! ```text
//! joining -> online -> evacuating -> evacuated -> restoring -> online
//!            online <-> offline
//!            evacuated -> (removed)
//! ```
//!
//! Every change is a single commit against the cluster store, followed by an
//! event on the bus.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use drover_events::{
    event_types, AggregateType, GroupCreatedPayload, GroupDeletedPayload,
    GroupRenamedPayload, MemberGroupsSetPayload, MemberJoinedPayload, MemberRemovedPayload,
    MemberRole, MemberRoleChangedPayload, MemberStatus, MemberStatusChangedPayload, SchedulerMode,
};
use drover_id::{MemberId, TokenId};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::events::EventBus;
use crate::network::{parse_address, NetworkError, NetworkResolver};
use crate::store::{
    ClusterSnapshot, Group, Member, Mutation, Project, Resources, StoragePool, StoreHandle,
    TargetScope, DEFAULT_GROUP,
};

/// Role limits and liveness thresholds.
#[derive(Debug, Clone, Copy)]
pub struct MembershipSettings {
    pub max_voters: usize,
    pub max_standby: usize,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
}

impl Default for MembershipSettings {
    fn default() -> Self {
        Self {
            max_voters: 3,
            max_standby: 2,
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 2,
        }
    }
}

impl MembershipSettings {
    /// Time without heartbeat after which an online member is marked offline.
    pub fn offline_threshold(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.max_missed_heartbeats.max(1))
    }
}

/// Identity and resources of a member being added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSpec {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub capacity: Resources,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Liveness report sent by a member.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatReport {
    #[serde(default)]
    pub capacity: Option<Resources>,
    /// The member is going down gracefully.
    #[serde(default)]
    pub shutting_down: bool,
}

/// A group together with the names of its members.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub description: String,
    pub members: Vec<String>,
}

/// Rejects names that would be ambiguous in target scopes or paths.
pub fn validate_name(kind: &str, name: &str) -> ClusterResult<()> {
    if name.is_empty() {
        return Err(ClusterError::InvalidRequest(format!("{kind} name is empty")));
    }
    if name.len() > 63 {
        return Err(ClusterError::InvalidRequest(format!(
            "{kind} name is longer than 63 characters"
        )));
    }
    if name.starts_with('@') || name.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(ClusterError::InvalidRequest(format!(
            "{kind} name {name:?} contains a reserved character"
        )));
    }
    Ok(())
}

/// Role for the next member given the current ones.
pub fn next_role(snapshot: &ClusterSnapshot, settings: &MembershipSettings) -> MemberRole {
    let count = |role| snapshot.members.values().filter(|m| m.role == role).count();
    if count(MemberRole::Voter) < settings.max_voters {
        MemberRole::Voter
    } else if count(MemberRole::StandBy) < settings.max_standby {
        MemberRole::StandBy
    } else {
        MemberRole::Spare
    }
}

/// Promotes online members to fill voter and stand-by slots, in name order.
///
/// Returns the members whose role changed, with their previous role.
pub fn rebalance_roles(
    members: &[Member],
    settings: &MembershipSettings,
) -> Vec<(Member, MemberRole)> {
    let mut members: Vec<Member> = members.to_vec();
    members.sort_by(|a, b| a.name.cmp(&b.name));
    let mut changed: Vec<(Member, MemberRole)> = Vec::new();

    let mut promote = |members: &mut Vec<Member>, from: MemberRole, to: MemberRole, limit: usize| {
        let mut have = members.iter().filter(|m| m.role == to).count();
        for member in members.iter_mut() {
            if have >= limit {
                break;
            }
            if member.role == from && member.status == MemberStatus::Online {
                let old = member.role;
                member.role = to;
                have += 1;
                match changed.iter_mut().find(|(m, _)| m.id == member.id) {
                    Some(entry) => entry.0 = member.clone(),
                    None => changed.push((member.clone(), old)),
                }
            }
        }
    };

    promote(&mut members, MemberRole::StandBy, MemberRole::Voter, settings.max_voters);
    promote(&mut members, MemberRole::Spare, MemberRole::StandBy, settings.max_standby);
    changed
}

/// Builds the record of a newly admitted member.
pub(crate) fn new_member(
    snapshot: &ClusterSnapshot,
    spec: &MemberSpec,
    address: String,
    status: MemberStatus,
    settings: &MembershipSettings,
) -> Member {
    let now = Utc::now();
    Member {
        id: MemberId::new(),
        name: spec.name.clone(),
        address,
        role: next_role(snapshot, settings),
        status,
        groups: BTreeSet::from([DEFAULT_GROUP.to_string()]),
        scheduler_mode: SchedulerMode::All,
        capacity: spec.capacity,
        load: Resources::ZERO,
        resource_count: 0,
        fingerprint: spec.fingerprint.clone(),
        last_heartbeat: Some(now),
        created_at: now,
        updated_at: now,
    }
}

fn find<'a>(snapshot: &'a ClusterSnapshot, name: &str) -> ClusterResult<&'a Member> {
    snapshot
        .member_by_name(name)
        .ok_or_else(|| ClusterError::MemberNotFound(name.to_string()))
}

/// Rewrites every resource scoped to `@group` to `scope`.
fn rescope_resources(
    snapshot: &ClusterSnapshot,
    group: &str,
    scope: &TargetScope,
    now: DateTime<Utc>,
    mutations: &mut Vec<Mutation>,
) {
    for resource in snapshot
        .resources
        .values()
        .filter(|r| matches!(&r.scope, TargetScope::Group(g) if g == group))
    {
        let mut resource = resource.clone();
        resource.scope = scope.clone();
        resource.updated_at = now;
        mutations.push(Mutation::PutResource(resource));
    }
}

fn invalid_address(e: NetworkError, address: &str) -> ClusterError {
    match e {
        NetworkError::InvalidAddress { address, reason } => {
            ClusterError::InvalidAddress { address, reason }
        }
        other => ClusterError::InvalidAddress {
            address: address.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Membership operations.
#[derive(Clone)]
pub struct Membership {
    store: StoreHandle,
    network: Arc<dyn NetworkResolver>,
    events: EventBus,
    settings: MembershipSettings,
}

impl Membership {
    pub fn new(
        store: StoreHandle,
        network: Arc<dyn NetworkResolver>,
        events: EventBus,
        settings: MembershipSettings,
    ) -> Self {
        Self {
            store,
            network,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &MembershipSettings {
        &self.settings
    }

    /// Creates the first member of a new cluster.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn bootstrap(&self, spec: MemberSpec) -> ClusterResult<Member> {
        validate_name("member", &spec.name)?;
        let address = parse_address(&spec.address).map_err(|e| invalid_address(e, &spec.address))?;
        let settings = self.settings;

        let member = self
            .store
            .transact(|snapshot| {
                if !snapshot.members.is_empty() {
                    return Err(ClusterError::InvalidState(
                        "cluster already has members".to_string(),
                    ));
                }
                let member = new_member(snapshot, &spec, address, MemberStatus::Online, &settings);
                Ok((vec![Mutation::PutMember(member.clone())], member))
            })
            .await?;

        info!(member_id = %member.id, "Bootstrapped cluster");
        self.publish_joined(&member, None);
        Ok(member)
    }

    /// Adds a member directly, without a join token.
    #[instrument(skip(self, spec), fields(name = %spec.name, address = %spec.address))]
    pub async fn add_member(&self, spec: MemberSpec) -> ClusterResult<Member> {
        validate_name("member", &spec.name)?;
        let address = parse_address(&spec.address).map_err(|e| invalid_address(e, &spec.address))?;

        if self.store.read().await?.member_by_name(&spec.name).is_some() {
            return Err(ClusterError::DuplicateName(spec.name));
        }
        self.network
            .probe(&address)
            .await
            .map_err(|e| invalid_address(e, &address))?;

        let settings = self.settings;
        let member = self
            .store
            .transact(|snapshot| {
                if snapshot.member_by_name(&spec.name).is_some() {
                    return Err(ClusterError::DuplicateName(spec.name.clone()));
                }
                let member = new_member(snapshot, &spec, address, MemberStatus::Online, &settings);
                Ok((vec![Mutation::PutMember(member.clone())], member))
            })
            .await?;

        info!(member_id = %member.id, role = %member.role, "Added member");
        self.publish_joined(&member, None);
        Ok(member)
    }

    pub(crate) fn publish_joined(&self, member: &Member, token_id: Option<TokenId>) {
        self.events.publish(
            AggregateType::Member,
            member.id.to_string(),
            event_types::MEMBER_JOINED,
            &MemberJoinedPayload {
                member_id: member.id,
                name: member.name.clone(),
                address: member.address.clone(),
                role: member.role,
                token_id,
            },
            None,
        );
    }

    /// Removes a member that hosts nothing and rebalances roles.
    #[instrument(skip(self))]
    pub async fn remove_member(&self, name: &str) -> ClusterResult<Member> {
        let settings = self.settings;
        let (removed, promoted) = self
            .store
            .transact(|snapshot| {
                let member = find(snapshot, name)?;
                let hosted = snapshot.hosted_resources(&member.id).count();
                let inbound = snapshot.inbound_resources(&member.id).count();
                if hosted + inbound > 0 {
                    return Err(ClusterError::MemberNotEvacuated(format!(
                        "{name} hosts {hosted} resources ({inbound} inbound)"
                    )));
                }

                let remaining: Vec<Member> = snapshot
                    .members
                    .values()
                    .filter(|m| m.id != member.id)
                    .cloned()
                    .collect();
                let promoted = rebalance_roles(&remaining, &settings);

                let mut mutations = vec![Mutation::DeleteMember(member.id)];
                mutations.extend(
                    promoted
                        .iter()
                        .map(|(m, _)| Mutation::PutMember(Member {
                            updated_at: Utc::now(),
                            ..m.clone()
                        })),
                );
                Ok((mutations, (member.clone(), promoted)))
            })
            .await?;

        info!(member_id = %removed.id, promoted = promoted.len(), "Removed member");
        self.events.publish(
            AggregateType::Member,
            removed.id.to_string(),
            event_types::MEMBER_REMOVED,
            &MemberRemovedPayload {
                member_id: removed.id,
                name: removed.name.clone(),
            },
            None,
        );
        for (member, old_role) in &promoted {
            self.publish_role_change(member, *old_role);
        }
        Ok(removed)
    }

    /// Deletes a member record without checks. Used to undo a failed join.
    pub(crate) async fn discard(&self, id: &MemberId) -> ClusterResult<()> {
        self.store
            .transact(|snapshot| {
                if !snapshot.members.contains_key(id) {
                    return Ok((Vec::new(), ()));
                }
                Ok((vec![Mutation::DeleteMember(*id)], ()))
            })
            .await?;
        warn!(member_id = %id, "Discarded member record");
        Ok(())
    }

    fn publish_role_change(&self, member: &Member, old_role: MemberRole) {
        info!(member = %member.name, %old_role, new_role = %member.role, "Member role changed");
        self.events.publish(
            AggregateType::Member,
            member.id.to_string(),
            event_types::MEMBER_ROLE_CHANGED,
            &MemberRoleChangedPayload {
                member_id: member.id,
                old_role,
                new_role: member.role,
            },
            None,
        );
    }

    /// Replaces a member's group set. A call that changes nothing commits nothing.
    #[instrument(skip(self, groups))]
    pub async fn set_groups(&self, name: &str, groups: Vec<String>) -> ClusterResult<Member> {
        let groups: BTreeSet<String> = groups.into_iter().map(|g| g.trim().to_string()).collect();

        let (member, changed) = self
            .store
            .transact(|snapshot| {
                let member = find(snapshot, name)?;
                if let Some(unknown) = groups.iter().find(|g| !snapshot.groups.contains_key(*g)) {
                    return Err(ClusterError::UnknownGroup(unknown.clone()));
                }
                if member.groups == groups {
                    return Ok((Vec::new(), (member.clone(), false)));
                }
                let mut member = member.clone();
                member.groups = groups.clone();
                member.updated_at = Utc::now();
                Ok((vec![Mutation::PutMember(member.clone())], (member, true)))
            })
            .await?;

        if changed {
            info!(member = %member.name, groups = ?member.groups, "Member groups set");
            self.events.publish(
                AggregateType::Member,
                member.id.to_string(),
                event_types::MEMBER_GROUPS_SET,
                &MemberGroupsSetPayload {
                    member_id: member.id,
                    groups: member.groups.iter().cloned().collect(),
                },
                None,
            );
        }
        Ok(member)
    }

    pub async fn set_scheduler_mode(&self, name: &str, mode: SchedulerMode) -> ClusterResult<Member> {
        self.store
            .transact(|snapshot| {
                let member = find(snapshot, name)?;
                if member.scheduler_mode == mode {
                    return Ok((Vec::new(), member.clone()));
                }
                let mut member = member.clone();
                member.scheduler_mode = mode;
                member.updated_at = Utc::now();
                Ok((vec![Mutation::PutMember(member.clone())], member))
            })
            .await
    }

    /// Records a heartbeat and applies the liveness transition it implies.
    pub async fn heartbeat(&self, name: &str, report: HeartbeatReport) -> ClusterResult<Member> {
        let now = Utc::now();
        let (member, old_status) = self
            .store
            .transact(|snapshot| {
                let current = find(snapshot, name)?;
                let mut member = current.clone();
                member.last_heartbeat = Some(now);
                member.updated_at = now;
                if let Some(capacity) = report.capacity {
                    member.capacity = capacity;
                }
                member.status = match current.status {
                    status if status.is_evacuation_state() => status,
                    MemberStatus::Joining => MemberStatus::Joining,
                    _ if report.shutting_down => MemberStatus::Offline,
                    MemberStatus::Offline => MemberStatus::Online,
                    status => status,
                };
                Ok((vec![Mutation::PutMember(member.clone())], (member, current.status)))
            })
            .await?;

        if member.status != old_status {
            self.publish_status_change(&member, old_status, "heartbeat");
        }
        Ok(member)
    }

    /// Marks online members offline once they missed too many heartbeats.
    pub async fn sweep_offline(&self, now: DateTime<Utc>) -> ClusterResult<Vec<Member>> {
        let threshold = chrono::Duration::from_std(self.settings.offline_threshold())
            .unwrap_or(chrono::Duration::MAX);

        let swept = self
            .store
            .transact(|snapshot| {
                let swept: Vec<Member> = snapshot
                    .members
                    .values()
                    .filter(|m| m.status == MemberStatus::Online)
                    .filter(|m| {
                        let last = m.last_heartbeat.unwrap_or(m.created_at);
                        now.signed_duration_since(last) > threshold
                    })
                    .map(|m| Member {
                        status: MemberStatus::Offline,
                        updated_at: now,
                        ..m.clone()
                    })
                    .collect();
                let mutations = swept.iter().cloned().map(Mutation::PutMember).collect();
                Ok((mutations, swept))
            })
            .await?;

        for member in &swept {
            self.publish_status_change(member, MemberStatus::Online, "missed heartbeats");
        }
        Ok(swept)
    }

    /// Offline members whose last heartbeat is older than `threshold`.
    pub async fn healing_candidates(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> ClusterResult<Vec<Member>> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let snapshot = self.store.read().await?;
        Ok(snapshot
            .members
            .into_values()
            .filter(|m| m.status == MemberStatus::Offline)
            .filter(|m| {
                let last = m.last_heartbeat.unwrap_or(m.created_at);
                now.signed_duration_since(last) > threshold
            })
            .collect())
    }

    /// Moves a member to `to` if its current status is one of `from`.
    ///
    /// An empty `from` accepts any status. Returns the member and its previous status.
    pub(crate) async fn transition(
        &self,
        id: &MemberId,
        from: &[MemberStatus],
        to: MemberStatus,
    ) -> ClusterResult<(Member, MemberStatus)> {
        let (member, old) = self
            .store
            .transact(|snapshot| {
                let current = snapshot
                    .members
                    .get(id)
                    .ok_or_else(|| ClusterError::MemberNotFound(id.to_string()))?;
                if !from.is_empty() && !from.contains(&current.status) {
                    return Err(ClusterError::InvalidState(format!(
                        "{} is {}",
                        current.name, current.status
                    )));
                }
                if current.status == to {
                    return Ok((Vec::new(), (current.clone(), to)));
                }
                let mut member = current.clone();
                member.status = to;
                member.updated_at = Utc::now();
                Ok((vec![Mutation::PutMember(member.clone())], (member, current.status)))
            })
            .await?;

        if old != to {
            self.publish_status_change(&member, old, "transition");
        }
        Ok((member, old))
    }

    fn publish_status_change(&self, member: &Member, old_status: MemberStatus, reason: &str) {
        info!(
            member = %member.name,
            %old_status,
            new_status = %member.status,
            reason,
            "Member status changed"
        );
        self.events.publish(
            AggregateType::Member,
            member.id.to_string(),
            event_types::MEMBER_STATUS_CHANGED,
            &MemberStatusChangedPayload {
                member_id: member.id,
                old_status,
                new_status: member.status,
            },
            None,
        );
    }

    pub async fn get(&self, id: &MemberId) -> ClusterResult<Member> {
        self.store
            .read()
            .await?
            .members
            .remove(id)
            .ok_or_else(|| ClusterError::MemberNotFound(id.to_string()))
    }

    pub async fn get_by_name(&self, name: &str) -> ClusterResult<Member> {
        let snapshot = self.store.read().await?;
        find(&snapshot, name).cloned()
    }

    /// All members, ordered by name.
    pub async fn list(&self) -> ClusterResult<Vec<Member>> {
        let mut members: Vec<Member> = self.store.read().await?.members.into_values().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(members)
    }

    #[instrument(skip(self, description))]
    pub async fn create_group(&self, name: &str, description: &str) -> ClusterResult<Group> {
        validate_name("group", name)?;
        let group = self
            .store
            .transact(|snapshot| {
                if snapshot.groups.contains_key(name) {
                    return Err(ClusterError::DuplicateName(name.to_string()));
                }
                let group = Group {
                    name: name.to_string(),
                    description: description.to_string(),
                };
                Ok((vec![Mutation::PutGroup(group.clone())], group))
            })
            .await?;

        self.events.publish(
            AggregateType::Group,
            name,
            event_types::GROUP_CREATED,
            &GroupCreatedPayload {
                name: name.to_string(),
            },
            None,
        );
        Ok(group)
    }

    /// Deletes a group and removes it from every member.
    ///
    /// Placed resources stay where they are; those scoped to the group fall
    /// back to any member.
    #[instrument(skip(self))]
    pub async fn delete_group(&self, name: &str) -> ClusterResult<()> {
        if name == DEFAULT_GROUP {
            return Err(ClusterError::InvalidRequest(
                "the default group cannot be deleted".to_string(),
            ));
        }

        let affected = self
            .store
            .transact(|snapshot| {
                if !snapshot.groups.contains_key(name) {
                    return Err(ClusterError::UnknownGroup(name.to_string()));
                }
                let now = Utc::now();
                let mut mutations = vec![Mutation::DeleteGroup(name.to_string())];
                let mut affected = Vec::new();
                for member in snapshot.members.values().filter(|m| m.in_group(name)) {
                    let mut member = member.clone();
                    member.groups.remove(name);
                    member.updated_at = now;
                    affected.push(member.id);
                    mutations.push(Mutation::PutMember(member));
                }
                for project in snapshot.projects.values().filter(|p| p.default_group == name) {
                    mutations.push(Mutation::PutProject(Project {
                        name: project.name.clone(),
                        default_group: DEFAULT_GROUP.to_string(),
                    }));
                }
                rescope_resources(snapshot, name, &TargetScope::Any, now, &mut mutations);
                Ok((mutations, affected))
            })
            .await?;

        info!(group = name, members = affected.len(), "Deleted group");
        self.events.publish(
            AggregateType::Group,
            name,
            event_types::GROUP_DELETED,
            &GroupDeletedPayload {
                name: name.to_string(),
                members: affected,
            },
            None,
        );
        Ok(())
    }

    /// Renames a group on the group record, its members, projects and the
    /// scopes of resources placed into it.
    #[instrument(skip(self))]
    pub async fn rename_group(&self, old_name: &str, new_name: &str) -> ClusterResult<Group> {
        if old_name == DEFAULT_GROUP || new_name == DEFAULT_GROUP {
            return Err(ClusterError::InvalidRequest(
                "the default group cannot be renamed".to_string(),
            ));
        }
        validate_name("group", new_name)?;

        let group = self
            .store
            .transact(|snapshot| {
                let existing = snapshot
                    .groups
                    .get(old_name)
                    .ok_or_else(|| ClusterError::UnknownGroup(old_name.to_string()))?;
                if snapshot.groups.contains_key(new_name) {
                    return Err(ClusterError::DuplicateName(new_name.to_string()));
                }

                let now = Utc::now();
                let group = Group {
                    name: new_name.to_string(),
                    description: existing.description.clone(),
                };
                let mut mutations = vec![
                    Mutation::DeleteGroup(old_name.to_string()),
                    Mutation::PutGroup(group.clone()),
                ];
                for member in snapshot.members.values().filter(|m| m.in_group(old_name)) {
                    let mut member = member.clone();
                    member.groups.remove(old_name);
                    member.groups.insert(new_name.to_string());
                    member.updated_at = now;
                    mutations.push(Mutation::PutMember(member));
                }
                for project in snapshot.projects.values().filter(|p| p.default_group == old_name) {
                    mutations.push(Mutation::PutProject(Project {
                        name: project.name.clone(),
                        default_group: new_name.to_string(),
                    }));
                }
                let scope = TargetScope::Group(new_name.to_string());
                rescope_resources(snapshot, old_name, &scope, now, &mut mutations);
                Ok((mutations, group))
            })
            .await?;

        self.events.publish(
            AggregateType::Group,
            new_name,
            event_types::GROUP_RENAMED,
            &GroupRenamedPayload {
                old_name: old_name.to_string(),
                new_name: new_name.to_string(),
            },
            None,
        );
        Ok(group)
    }

    pub async fn list_groups(&self) -> ClusterResult<Vec<GroupSummary>> {
        let snapshot = self.store.read().await?;
        Ok(snapshot
            .groups
            .values()
            .map(|g| {
                let mut members: Vec<String> = snapshot
                    .members
                    .values()
                    .filter(|m| m.in_group(&g.name))
                    .map(|m| m.name.clone())
                    .collect();
                members.sort();
                GroupSummary {
                    name: g.name.clone(),
                    description: g.description.clone(),
                    members,
                }
            })
            .collect())
    }

    /// Sets the group the `group` placement policy uses for a project.
    pub async fn set_project_group(&self, project: &str, group: &str) -> ClusterResult<Project> {
        validate_name("project", project)?;
        self.store
            .transact(|snapshot| {
                if !snapshot.groups.contains_key(group) {
                    return Err(ClusterError::UnknownGroup(group.to_string()));
                }
                let project = Project {
                    name: project.to_string(),
                    default_group: group.to_string(),
                };
                if snapshot.projects.get(&project.name) == Some(&project) {
                    return Ok((Vec::new(), project));
                }
                Ok((vec![Mutation::PutProject(project.clone())], project))
            })
            .await
    }

    pub async fn create_pool(&self, name: &str, remote: bool) -> ClusterResult<StoragePool> {
        validate_name("pool", name)?;
        self.store
            .transact(|snapshot| {
                if snapshot.pools.contains_key(name) {
                    return Err(ClusterError::DuplicateName(name.to_string()));
                }
                let pool = StoragePool {
                    name: name.to_string(),
                    remote,
                };
                Ok((vec![Mutation::PutPool(pool.clone())], pool))
            })
            .await
    }
}
