//! Placement of instances and volumes on members.
//!
//! The placer is responsible for:
//! - Choosing a member for new resources ([`scorer`])
//! - Recording the resource and the member's load increment in one commit
//! - Creating volumes through the storage backend
//! - Moving resources between members through the migration transport
//! - Releasing resources and their load
//!
//! A move reserves capacity on the target before any data is copied. The
//! host pointer and the source's load change only once the target committed
//! the handoff.

mod scorer;

use std::sync::Arc;

use chrono::Utc;
use drover_events::{
    event_types, AggregateType, EvacuatePolicy, PowerState, ResourceKind, ResourceMovedPayload,
    ResourcePlacedPayload, ResourceReleasedPayload,
};
use drover_id::{InstanceId, MemberId, OperationId, ResourceId, VolumeId};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::events::EventBus;
use crate::migration::{TransferReport, TransferRequest, Transport};
use crate::operations::CancelToken;
use crate::runtime::{apply_action, ResourceRuntime, RuntimeAction};
use crate::storage::StorageBackend;
use crate::store::{
    ClusterSnapshot, EvacuationMark, LiveMigrationProfile, Member, Mutation, Resource, Resources,
    StoreHandle, TargetScope,
};

pub use scorer::{load_score, select_member, PlacementPolicy, PlacementQuery, ScoreWeights};

fn default_project() -> String {
    "default".to_string()
}

/// Request to place a new resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default = "default_project")]
    pub project: String,
    /// Empty for any member, a member name, or `@group`.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub requirements: Resources,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub live_migration: LiveMigrationProfile,
    /// How an `auto` evacuation treats the resource.
    #[serde(default)]
    pub evacuate_policy: EvacuatePolicy,
    /// Start the instance once placed.
    #[serde(default)]
    pub start: bool,
}

/// Result of a placement.
#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub resource_id: ResourceId,
    pub name: String,
    pub project: String,
    pub kind: ResourceKind,
    /// `None` for volumes on remote pools.
    pub member_id: Option<MemberId>,
    pub member_name: Option<String>,
    pub power_state: PowerState,
}

/// What a completed move does to the resource's evacuation mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkChange {
    Keep,
    Set(EvacuationMark),
    Clear,
}

/// Request to move a placed resource to another member.
#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub resource_id: ResourceId,
    /// `None` reuses the scope the resource was placed with.
    pub scope: Option<TargetScope>,
    pub live: bool,
    pub allow_restoring: bool,
    pub mark: MarkChange,
    pub operation_id: Option<OperationId>,
}

impl MoveRequest {
    pub fn new(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            scope: None,
            live: false,
            allow_restoring: false,
            mark: MarkChange::Keep,
            operation_id: None,
        }
    }
}

/// Result of a move.
#[derive(Debug, Clone, Serialize)]
pub struct MoveOutcome {
    pub resource_id: ResourceId,
    pub from: MemberId,
    pub to: MemberId,
    pub to_name: String,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferReport>,
    /// Set when a cold-migrated instance could not be started on the target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_error: Option<String>,
}

/// Placement tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlacementSettings {
    pub policy: PlacementPolicy,
    pub weights: ScoreWeights,
}

struct Reservation {
    resource: Resource,
    source: Member,
    target: Member,
}

/// Places, moves and releases resources.
#[derive(Clone)]
pub struct Placer {
    store: StoreHandle,
    storage: Arc<dyn StorageBackend>,
    runtime: Arc<dyn ResourceRuntime>,
    transport: Transport,
    events: EventBus,
    settings: PlacementSettings,
}

impl Placer {
    pub fn new(
        store: StoreHandle,
        storage: Arc<dyn StorageBackend>,
        runtime: Arc<dyn ResourceRuntime>,
        transport: Transport,
        events: EventBus,
        settings: PlacementSettings,
    ) -> Self {
        Self {
            store,
            storage,
            runtime,
            transport,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &PlacementSettings {
        &self.settings
    }

    /// Chooses a member and records the resource against it in one commit.
    #[instrument(skip(self, request), fields(name = %request.name, project = %request.project, kind = ?request.kind))]
    pub async fn place(&self, request: PlacementRequest) -> ClusterResult<Placement> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(ClusterError::InvalidRequest("resource name is empty".to_string()));
        }
        if request.kind == ResourceKind::Volume && request.pool.is_none() {
            return Err(ClusterError::InvalidRequest(
                "volume placement requires a storage pool".to_string(),
            ));
        }

        let scope = TargetScope::parse(request.target.as_deref());
        let id: ResourceId = match request.kind {
            ResourceKind::Instance => InstanceId::new().into(),
            ResourceKind::Volume => VolumeId::new().into(),
        };
        let settings = self.settings;

        let (resource, host) = self
            .store
            .transact(|snapshot| {
                if snapshot
                    .resource_by_name(&request.project, request.kind, &name)
                    .is_some()
                {
                    return Err(ClusterError::DuplicateName(format!(
                        "{}/{name}",
                        request.project
                    )));
                }

                let remote = match &request.pool {
                    Some(pool) => {
                        snapshot
                            .pools
                            .get(pool)
                            .ok_or_else(|| {
                                ClusterError::InvalidRequest(format!("unknown storage pool {pool}"))
                            })?
                            .remote
                    }
                    None => false,
                };

                let host = if request.kind == ResourceKind::Volume && remote {
                    None
                } else {
                    let query = PlacementQuery {
                        scope: &scope,
                        project: &request.project,
                        demand: request.requirements,
                        policy: settings.policy,
                        weights: settings.weights,
                        exclude: None,
                        allow_restoring: false,
                    };
                    Some(select_member(snapshot, &query)?.clone())
                };

                let now = Utc::now();
                let resource = Resource {
                    id,
                    name: name.clone(),
                    project: request.project.clone(),
                    kind: request.kind,
                    host: host.as_ref().map(|m| m.id),
                    requirements: request.requirements,
                    pool: request.pool.clone(),
                    size_bytes: request.size_bytes,
                    power_state: PowerState::Stopped,
                    live_migration: request.live_migration,
                    evacuate_policy: request.evacuate_policy,
                    scope: scope.clone(),
                    evacuation: None,
                    migration_target: None,
                    created_at: now,
                    updated_at: now,
                };

                let mut mutations = vec![Mutation::PutResource(resource.clone())];
                if let Some(member) = &host {
                    let mut member = member.clone();
                    member.load = member.load.saturating_add(&request.requirements);
                    member.resource_count += 1;
                    member.updated_at = now;
                    mutations.push(Mutation::PutMember(member));
                }
                Ok((mutations, (resource, host)))
            })
            .await?;

        if let (ResourceId::Volume(volume), Some(pool)) = (&resource.id, &resource.pool) {
            let host_id = host.as_ref().map(|m| &m.id);
            if let Err(e) = self
                .storage
                .create_volume(pool, volume, host_id, resource.size_bytes)
                .await
            {
                warn!(resource = %resource.id, error = %e, "Volume creation failed, releasing allocation");
                self.forget(&resource.id).await?;
                return Err(e.into());
            }
        }

        let mut power_state = resource.power_state;
        if request.start && resource.kind == ResourceKind::Instance {
            if let Some(member) = &host {
                if let Err(e) = self.runtime.start(member, &resource).await {
                    warn!(resource = %resource.id, error = %e, "Start after placement failed, releasing allocation");
                    self.forget(&resource.id).await?;
                    return Err(e.into());
                }
                self.record_power_state(&resource.id, PowerState::Running).await?;
                power_state = PowerState::Running;
            }
        }

        info!(
            resource_id = %resource.id,
            member = host.as_ref().map(|m| m.name.as_str()).unwrap_or("-"),
            "Placed resource"
        );
        self.events.publish(
            AggregateType::Resource,
            resource.id.to_string(),
            event_types::RESOURCE_PLACED,
            &ResourcePlacedPayload {
                resource_id: resource.id,
                name: resource.name.clone(),
                project: resource.project.clone(),
                member_id: resource.host,
            },
            None,
        );

        Ok(Placement {
            resource_id: resource.id,
            name: resource.name,
            project: resource.project,
            kind: resource.kind,
            member_id: host.as_ref().map(|m| m.id),
            member_name: host.map(|m| m.name),
            power_state,
        })
    }

    /// Deletes a resource and returns its load to the host.
    #[instrument(skip(self))]
    pub async fn release(&self, resource_id: &ResourceId) -> ClusterResult<Resource> {
        let snapshot = self.store.read().await?;
        let resource = lookup(&snapshot, resource_id)?;
        if resource.migration_target.is_some() {
            return Err(ClusterError::InvalidState(format!(
                "resource {resource_id} is being migrated"
            )));
        }
        let host = resource.host.and_then(|id| snapshot.members.get(&id));

        if resource.is_running() {
            if let Some(member) = host {
                self.runtime.stop(member, resource).await?;
            }
        }
        if let (ResourceId::Volume(volume), Some(pool)) = (&resource.id, &resource.pool) {
            self.storage
                .delete_volume(pool, volume, resource.host.as_ref())
                .await?;
        }

        let released = self.forget(resource_id).await?;
        info!(resource_id = %resource_id, "Released resource");
        self.events.publish(
            AggregateType::Resource,
            resource_id.to_string(),
            event_types::RESOURCE_RELEASED,
            &ResourceReleasedPayload {
                resource_id: *resource_id,
                member_id: released.host,
            },
            None,
        );
        Ok(released)
    }

    /// Removes the record and its load without touching runtime or storage.
    async fn forget(&self, resource_id: &ResourceId) -> ClusterResult<Resource> {
        self.store
            .transact(|snapshot| {
                let resource = lookup(snapshot, resource_id)?.clone();
                let mut mutations = vec![Mutation::DeleteResource(resource.id)];
                if let Some(member) = resource.host.and_then(|id| snapshot.members.get(&id)) {
                    let mut member = member.clone();
                    member.load = member.load.saturating_sub(&resource.requirements);
                    member.resource_count = member.resource_count.saturating_sub(1);
                    member.updated_at = Utc::now();
                    mutations.push(Mutation::PutMember(member));
                }
                Ok((mutations, resource))
            })
            .await
    }

    /// Drives an instance to `state` through the runtime and records it.
    #[instrument(skip(self))]
    pub async fn set_power_state(
        &self,
        resource_id: &ResourceId,
        state: PowerState,
    ) -> ClusterResult<Resource> {
        let snapshot = self.store.read().await?;
        let resource = lookup(&snapshot, resource_id)?;
        if resource.kind != ResourceKind::Instance {
            return Err(ClusterError::InvalidRequest(format!(
                "{resource_id} is not an instance"
            )));
        }
        let member = resource
            .host
            .and_then(|id| snapshot.members.get(&id))
            .ok_or_else(|| ClusterError::InvalidState(format!("{resource_id} has no host")))?;

        let action = match (resource.power_state, state) {
            (from, to) if from == to => None,
            (PowerState::Frozen, PowerState::Running) => Some(RuntimeAction::Unfreeze),
            (_, PowerState::Running) => Some(RuntimeAction::Start),
            (PowerState::Running, PowerState::Frozen) => Some(RuntimeAction::Freeze),
            (_, PowerState::Stopped) => Some(RuntimeAction::Stop),
            (PowerState::Stopped, PowerState::Frozen) => {
                return Err(ClusterError::InvalidState(format!(
                    "{resource_id} must be running to freeze"
                )))
            }
            _ => None,
        };

        let resumes = matches!(action, Some(RuntimeAction::Start | RuntimeAction::Unfreeze));
        if resumes && member.status.is_evacuation_state() {
            return Err(ClusterError::InvalidState(format!(
                "cluster member is evacuated: {} is {}",
                member.name, member.status
            )));
        }
        if let Some(action) = action {
            apply_action(self.runtime.as_ref(), action, member, resource).await?;
        }
        self.record_power_state(resource_id, state).await
    }

    pub(crate) async fn record_power_state(
        &self,
        resource_id: &ResourceId,
        state: PowerState,
    ) -> ClusterResult<Resource> {
        self.update_resource(resource_id, |r| r.power_state = state)
            .await
    }

    pub(crate) async fn update_resource<F>(
        &self,
        resource_id: &ResourceId,
        change: F,
    ) -> ClusterResult<Resource>
    where
        F: FnOnce(&mut Resource),
    {
        self.store
            .transact(|snapshot| {
                let before = lookup(snapshot, resource_id)?;
                let mut resource = before.clone();
                change(&mut resource);
                if &resource == before {
                    return Ok((Vec::new(), resource));
                }
                resource.updated_at = Utc::now();
                Ok((vec![Mutation::PutResource(resource.clone())], resource))
            })
            .await
    }

    pub async fn get_resource(&self, resource_id: &ResourceId) -> ClusterResult<Resource> {
        let snapshot = self.store.read().await?;
        lookup(&snapshot, resource_id).cloned()
    }

    /// Lists resources, optionally only those hosted on `member`.
    pub async fn list_resources(&self, member: Option<&MemberId>) -> ClusterResult<Vec<Resource>> {
        let snapshot = self.store.read().await?;
        Ok(snapshot
            .resources
            .into_values()
            .filter(|r| member.is_none() || r.host.as_ref() == member)
            .collect())
    }

    /// Moves a resource to another member.
    ///
    /// Instances are transferred through the migration transport; cold moves
    /// stop the instance first and start it on the target if it was running.
    /// Member-local volumes are cloned by the storage backend.
    #[instrument(skip(self, request, cancel), fields(resource = %request.resource_id, live = request.live))]
    pub async fn relocate(
        &self,
        request: MoveRequest,
        cancel: &CancelToken,
    ) -> ClusterResult<MoveOutcome> {
        cancel.check()?;

        let current = self.get_resource(&request.resource_id).await?;
        if request.live && current.kind == ResourceKind::Instance {
            if !current.is_running() {
                return Err(ClusterError::InvalidState(format!(
                    "{} must be running to live-migrate",
                    current.name
                )));
            }
            if !current.live_migration.is_eligible() {
                return Err(ClusterError::InvalidRequest(format!(
                    "{} is not eligible for live migration",
                    current.name
                )));
            }
        }

        let reservation = self.reserve_move(&request).await?;
        let outcome = match reservation.resource.kind {
            ResourceKind::Volume => self.move_volume(&request, &reservation).await,
            ResourceKind::Instance => self.move_instance(&request, &reservation, cancel).await,
        };

        if let Ok(outcome) = &outcome {
            info!(
                resource_id = %outcome.resource_id,
                from = %reservation.source.name,
                to = %reservation.target.name,
                live = outcome.live,
                "Moved resource"
            );
            self.events.publish(
                AggregateType::Resource,
                outcome.resource_id.to_string(),
                event_types::RESOURCE_MOVED,
                &ResourceMovedPayload {
                    resource_id: outcome.resource_id,
                    from_member: outcome.from,
                    to_member: outcome.to,
                    live: outcome.live,
                },
                request.operation_id,
            );
        }
        outcome
    }

    async fn move_volume(
        &self,
        request: &MoveRequest,
        reservation: &Reservation,
    ) -> ClusterResult<MoveOutcome> {
        let Reservation {
            resource,
            source,
            target,
        } = reservation;
        let (ResourceId::Volume(volume), Some(pool)) = (&resource.id, &resource.pool) else {
            self.cancel_move(&resource.id, &target.id).await?;
            return Err(ClusterError::InvalidState(format!(
                "{} has no storage pool",
                resource.id
            )));
        };

        if let Err(e) = self
            .storage
            .clone_volume(pool, volume, &source.id, &target.id)
            .await
        {
            self.cancel_move(&resource.id, &target.id).await?;
            return Err(e.into());
        }

        if let Err(e) = self.complete_move(&resource.id, &target.id, request.mark).await {
            if let Err(cleanup) = self.storage.delete_volume(pool, volume, Some(&target.id)).await {
                warn!(resource = %resource.id, error = %cleanup, "Failed to delete target volume copy");
            }
            self.cancel_move(&resource.id, &target.id).await?;
            return Err(e);
        }

        if let Err(e) = self.storage.delete_volume(pool, volume, Some(&source.id)).await {
            warn!(resource = %resource.id, error = %e, "Failed to delete source volume copy");
        }

        Ok(MoveOutcome {
            resource_id: resource.id,
            from: source.id,
            to: target.id,
            to_name: target.name.clone(),
            live: false,
            transfer: None,
            start_error: None,
        })
    }

    async fn move_instance(
        &self,
        request: &MoveRequest,
        reservation: &Reservation,
        cancel: &CancelToken,
    ) -> ClusterResult<MoveOutcome> {
        let Reservation {
            resource,
            source,
            target,
        } = reservation;
        let live = request.live;
        let restart = !live && resource.is_running();

        if restart {
            if let Err(e) = self.runtime.stop(source, resource).await {
                self.cancel_move(&resource.id, &target.id).await?;
                return Err(e.into());
            }
        }

        let transfer = TransferRequest {
            resource,
            source,
            target,
            live,
            operation_id: request.operation_id,
        };
        let handoff = match self.transport.transfer(transfer, cancel).await {
            Ok(handoff) => handoff,
            Err(e) => {
                self.cancel_move(&resource.id, &target.id).await?;
                if restart {
                    self.restart_on(source, resource).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.complete_move(&resource.id, &target.id, request.mark).await {
            handoff.rollback(&e.to_string()).await;
            self.cancel_move(&resource.id, &target.id).await?;
            if restart {
                self.restart_on(source, resource).await;
            }
            return Err(e);
        }
        let report = handoff.release().await;

        let mut start_error = None;
        if restart {
            if let Err(e) = self.runtime.start(target, resource).await {
                warn!(resource = %resource.id, target = %target.name, error = %e, "Moved instance failed to start");
                self.record_power_state(&resource.id, PowerState::Stopped)
                    .await?;
                start_error = Some(e.to_string());
            }
        }

        Ok(MoveOutcome {
            resource_id: resource.id,
            from: source.id,
            to: target.id,
            to_name: target.name.clone(),
            live,
            transfer: Some(report),
            start_error,
        })
    }

    async fn restart_on(&self, member: &Member, resource: &Resource) {
        if let Err(e) = self.runtime.start(member, resource).await {
            warn!(resource = %resource.id, member = %member.name, error = %e, "Failed to restart instance on source");
        }
    }

    /// Picks a target and reserves the resource's requirements on it.
    async fn reserve_move(&self, request: &MoveRequest) -> ClusterResult<Reservation> {
        let settings = self.settings;
        self.store
            .transact(|snapshot| {
                let resource = lookup(snapshot, &request.resource_id)?;
                if resource.migration_target.is_some() {
                    return Err(ClusterError::InvalidState(format!(
                        "{} is already being migrated",
                        resource.id
                    )));
                }
                let source = resource
                    .host
                    .and_then(|id| snapshot.members.get(&id))
                    .ok_or_else(|| {
                        ClusterError::InvalidRequest(format!(
                            "{} is not bound to a member",
                            resource.id
                        ))
                    })?;

                // A resource pinned to its own host can still move anywhere.
                let scope = match (&request.scope, &resource.scope) {
                    (Some(scope), _) => scope.clone(),
                    (None, TargetScope::Member(name)) if *name == source.name => TargetScope::Any,
                    (None, scope) => scope.clone(),
                };
                let query = PlacementQuery {
                    scope: &scope,
                    project: &resource.project,
                    demand: resource.requirements,
                    policy: settings.policy,
                    weights: settings.weights,
                    exclude: Some(&source.id),
                    allow_restoring: request.allow_restoring,
                };
                let target = select_member(snapshot, &query)?;

                let now = Utc::now();
                let mut reserved = target.clone();
                reserved.load = reserved.load.saturating_add(&resource.requirements);
                reserved.updated_at = now;
                let mut resource = resource.clone();
                resource.migration_target = Some(target.id);
                resource.updated_at = now;

                Ok((
                    vec![
                        Mutation::PutMember(reserved.clone()),
                        Mutation::PutResource(resource.clone()),
                    ],
                    Reservation {
                        resource,
                        source: source.clone(),
                        target: reserved,
                    },
                ))
            })
            .await
    }

    /// Drops an inbound reservation.
    async fn cancel_move(&self, resource_id: &ResourceId, target: &MemberId) -> ClusterResult<()> {
        self.store
            .transact(|snapshot| {
                let Some(resource) = snapshot.resources.get(resource_id) else {
                    return Ok((Vec::new(), ()));
                };
                if resource.migration_target.as_ref() != Some(target) {
                    return Ok((Vec::new(), ()));
                }
                let now = Utc::now();
                let mut resource = resource.clone();
                resource.migration_target = None;
                resource.updated_at = now;
                let mut mutations = Vec::with_capacity(2);
                if let Some(member) = snapshot.members.get(target) {
                    let mut member = member.clone();
                    member.load = member.load.saturating_sub(&resource.requirements);
                    member.updated_at = now;
                    mutations.push(Mutation::PutMember(member));
                }
                mutations.push(Mutation::PutResource(resource));
                Ok((mutations, ()))
            })
            .await
    }

    /// Moves the host pointer and counters to the reserved target.
    async fn complete_move(
        &self,
        resource_id: &ResourceId,
        target: &MemberId,
        mark: MarkChange,
    ) -> ClusterResult<()> {
        self.store
            .transact(|snapshot| {
                let resource = lookup(snapshot, resource_id)?;
                if resource.migration_target.as_ref() != Some(target) {
                    return Err(ClusterError::InvalidState(format!(
                        "reservation for {resource_id} was lost"
                    )));
                }
                let target_member = snapshot
                    .members
                    .get(target)
                    .ok_or_else(|| ClusterError::MemberNotFound(target.to_string()))?;

                let now = Utc::now();
                let mut mutations = Vec::with_capacity(3);
                if let Some(source) = resource.host.and_then(|id| snapshot.members.get(&id)) {
                    let mut source = source.clone();
                    source.load = source.load.saturating_sub(&resource.requirements);
                    source.resource_count = source.resource_count.saturating_sub(1);
                    source.updated_at = now;
                    mutations.push(Mutation::PutMember(source));
                }

                let mut target_member = target_member.clone();
                target_member.resource_count += 1;
                target_member.updated_at = now;
                mutations.push(Mutation::PutMember(target_member));

                let mut resource = resource.clone();
                resource.host = Some(*target);
                resource.migration_target = None;
                resource.updated_at = now;
                match mark {
                    MarkChange::Keep => {}
                    MarkChange::Set(mark) => resource.evacuation = Some(mark),
                    MarkChange::Clear => resource.evacuation = None,
                }
                mutations.push(Mutation::PutResource(resource));

                Ok((mutations, ()))
            })
            .await
    }
}

fn lookup<'a>(snapshot: &'a ClusterSnapshot, id: &ResourceId) -> ClusterResult<&'a Resource> {
    snapshot
        .resources
        .get(id)
        .ok_or_else(|| ClusterError::ResourceNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MemoryPeerDirectory, TransferSettings};
    use crate::network::StaticNetwork;
    use crate::runtime::MockRuntime;
    use crate::storage::MemoryStorage;
    use crate::store::{MemoryStore, StoragePool};
    use drover_events::{MemberRole, MemberStatus, SchedulerMode};
    use std::collections::BTreeSet;

    struct Fixture {
        placer: Placer,
        store: StoreHandle,
        runtime: Arc<MockRuntime>,
        storage: Arc<MemoryStorage>,
        peers: Arc<MemoryPeerDirectory>,
    }

    fn fixture() -> Fixture {
        let store = StoreHandle::new(Arc::new(MemoryStore::new()));
        let runtime = Arc::new(MockRuntime::new());
        let storage = Arc::new(MemoryStorage::new());
        let peers = Arc::new(MemoryPeerDirectory::new());
        let events = EventBus::new();
        let transport = Transport::new(
            Arc::new(StaticNetwork::new()),
            peers.clone(),
            events.clone(),
            TransferSettings::default(),
        );
        let placer = Placer::new(
            store.clone(),
            storage.clone(),
            runtime.clone(),
            transport,
            events,
            PlacementSettings::default(),
        );
        Fixture {
            placer,
            store,
            runtime,
            storage,
            peers,
        }
    }

    async fn add_member(store: &StoreHandle, name: &str, capacity: Resources) -> Member {
        let now = Utc::now();
        let member = Member {
            id: MemberId::new(),
            name: name.to_string(),
            address: format!("{name}.cluster:8443"),
            role: MemberRole::Voter,
            status: MemberStatus::Online,
            groups: BTreeSet::from(["default".to_string()]),
            scheduler_mode: SchedulerMode::All,
            capacity,
            load: Resources::ZERO,
            resource_count: 0,
            fingerprint: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        };
        let put = member.clone();
        store
            .transact(move |_| Ok((vec![Mutation::PutMember(put)], ())))
            .await
            .unwrap();
        member
    }

    async fn add_pool(store: &StoreHandle, name: &str, remote: bool) {
        let pool = StoragePool {
            name: name.to_string(),
            remote,
        };
        store
            .transact(move |_| Ok((vec![Mutation::PutPool(pool)], ())))
            .await
            .unwrap();
    }

    fn instance(name: &str, target: Option<&str>, cpu: u64) -> PlacementRequest {
        PlacementRequest {
            kind: ResourceKind::Instance,
            name: name.to_string(),
            project: "default".to_string(),
            target: target.map(str::to_string),
            requirements: Resources::new(cpu, 1 << 20),
            pool: None,
            size_bytes: 0,
            live_migration: LiveMigrationProfile::default(),
            evacuate_policy: Default::default(),
            start: false,
        }
    }

    async fn member_named(store: &StoreHandle, name: &str) -> Member {
        store
            .read()
            .await
            .unwrap()
            .member_by_name(name)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_place_increments_load_in_same_commit() {
        let f = fixture();
        add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;

        let placement = f.placer.place(instance("web", None, 1000)).await.unwrap();
        assert_eq!(placement.member_name.as_deref(), Some("m1"));

        let m1 = member_named(&f.store, "m1").await;
        assert_eq!(m1.load, Resources::new(1000, 1 << 20));
        assert_eq!(m1.resource_count, 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let f = fixture();
        add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        f.placer.place(instance("web", None, 100)).await.unwrap();

        let err = f.placer.place(instance("web", None, 100)).await.unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn test_place_and_start() {
        let f = fixture();
        add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        let mut request = instance("web", Some("m1"), 100);
        request.start = true;

        let placement = f.placer.place(request).await.unwrap();
        assert_eq!(placement.power_state, PowerState::Running);
        assert_eq!(f.runtime.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_volume_has_no_host() {
        let f = fixture();
        add_pool(&f.store, "ceph", true).await;

        let request = PlacementRequest {
            kind: ResourceKind::Volume,
            name: "data".to_string(),
            project: "default".to_string(),
            target: None,
            requirements: Resources::ZERO,
            pool: Some("ceph".to_string()),
            size_bytes: 1 << 30,
            live_migration: LiveMigrationProfile::default(),
            evacuate_policy: Default::default(),
            start: false,
        };
        let placement = f.placer.place(request).await.unwrap();
        assert!(placement.member_id.is_none());
        assert_eq!(f.storage.volume_count(), 1);
    }

    #[tokio::test]
    async fn test_volume_creation_failure_releases_allocation() {
        let f = fixture();
        let m1 = add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        add_pool(&f.store, "local", false).await;
        f.storage.fail_pool("local");

        let request = PlacementRequest {
            kind: ResourceKind::Volume,
            name: "data".to_string(),
            project: "default".to_string(),
            target: None,
            requirements: Resources::new(0, 1 << 20),
            pool: Some("local".to_string()),
            size_bytes: 1 << 30,
            live_migration: LiveMigrationProfile::default(),
            evacuate_policy: Default::default(),
            start: false,
        };
        let err = f.placer.place(request).await.unwrap_err();
        assert!(matches!(err, ClusterError::Storage(_)));

        let snapshot = f.store.read().await.unwrap();
        assert!(snapshot.resources.is_empty());
        assert_eq!(snapshot.members[&m1.id].load, Resources::ZERO);
    }

    #[tokio::test]
    async fn test_release_returns_load() {
        let f = fixture();
        add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        let placement = f.placer.place(instance("web", None, 1000)).await.unwrap();

        f.placer.release(&placement.resource_id).await.unwrap();
        let m1 = member_named(&f.store, "m1").await;
        assert_eq!(m1.load, Resources::ZERO);
        assert_eq!(m1.resource_count, 0);
        assert!(matches!(
            f.placer.get_resource(&placement.resource_id).await,
            Err(ClusterError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_power_state() {
        let f = fixture();
        add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        let placement = f.placer.place(instance("web", None, 100)).await.unwrap();

        let err = f
            .placer
            .set_power_state(&placement.resource_id, PowerState::Frozen)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidState(_)));

        f.placer
            .set_power_state(&placement.resource_id, PowerState::Running)
            .await
            .unwrap();
        let frozen = f
            .placer
            .set_power_state(&placement.resource_id, PowerState::Frozen)
            .await
            .unwrap();
        assert_eq!(frozen.power_state, PowerState::Frozen);

        let actions: Vec<_> = f.runtime.calls().into_iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![RuntimeAction::Start, RuntimeAction::Freeze]);
    }

    #[tokio::test]
    async fn test_cold_move_restarts_on_target() {
        let f = fixture();
        let m1 = add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        let mut request = instance("web", Some("m1"), 1000);
        request.start = true;
        let placement = f.placer.place(request).await.unwrap();
        let m2 = add_member(&f.store, "m2", Resources::new(4000, 8 << 30)).await;

        let outcome = f
            .placer
            .relocate(MoveRequest::new(placement.resource_id), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(outcome.to, m2.id);
        assert!(outcome.start_error.is_none());

        let snapshot = f.store.read().await.unwrap();
        let resource = &snapshot.resources[&placement.resource_id];
        assert_eq!(resource.host, Some(m2.id));
        assert!(resource.migration_target.is_none());
        assert_eq!(snapshot.members[&m1.id].load, Resources::ZERO);
        assert_eq!(snapshot.members[&m2.id].load, Resources::new(1000, 1 << 20));
        assert_eq!(snapshot.members[&m2.id].resource_count, 1);

        let actions: Vec<_> = f.runtime.calls().into_iter().map(|c| (c.action, c.member)).collect();
        assert_eq!(
            actions,
            vec![
                (RuntimeAction::Start, m1.id),
                (RuntimeAction::Stop, m1.id),
                (RuntimeAction::Start, m2.id),
            ]
        );
        assert!(f.peers.peer_for(m1.id).was_released(&placement.resource_id));
    }

    #[tokio::test]
    async fn test_failed_transfer_keeps_source_authoritative() {
        let f = fixture();
        let m1 = add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        let placement = f.placer.place(instance("web", None, 1000)).await.unwrap();
        let m2 = add_member(&f.store, "m2", Resources::new(4000, 8 << 30)).await;
        f.peers.peer_for(m2.id).set_fail_commit(true);

        let err = f
            .placer
            .relocate(MoveRequest::new(placement.resource_id), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::TransferFailed(_)));

        let snapshot = f.store.read().await.unwrap();
        let resource = &snapshot.resources[&placement.resource_id];
        assert_eq!(resource.host, Some(m1.id));
        assert!(resource.migration_target.is_none());
        assert_eq!(snapshot.members[&m2.id].load, Resources::ZERO);
        assert_eq!(snapshot.members[&m1.id].load, Resources::new(1000, 1 << 20));
    }

    #[tokio::test]
    async fn test_live_move_requires_eligibility() {
        let f = fixture();
        add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        let mut request = instance("web", None, 100);
        request.start = true;
        let placement = f.placer.place(request).await.unwrap();
        add_member(&f.store, "m2", Resources::new(4000, 8 << 30)).await;

        let mut mv = MoveRequest::new(placement.resource_id);
        mv.live = true;
        let err = f.placer.relocate(mv, &CancelToken::never()).await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_move_local_volume() {
        let f = fixture();
        let m1 = add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        add_pool(&f.store, "local", false).await;
        let request = PlacementRequest {
            kind: ResourceKind::Volume,
            name: "data".to_string(),
            project: "default".to_string(),
            target: Some("m1".to_string()),
            requirements: Resources::ZERO,
            pool: Some("local".to_string()),
            size_bytes: 1 << 30,
            live_migration: LiveMigrationProfile::default(),
            evacuate_policy: Default::default(),
            start: false,
        };
        let placement = f.placer.place(request).await.unwrap();
        let m2 = add_member(&f.store, "m2", Resources::new(4000, 8 << 30)).await;
        let ResourceId::Volume(volume) = placement.resource_id else {
            panic!("expected a volume id");
        };

        f.placer
            .relocate(MoveRequest::new(placement.resource_id), &CancelToken::never())
            .await
            .unwrap();
        assert!(f.storage.contains("local", &volume, Some(&m2.id)));
        assert!(!f.storage.contains("local", &volume, Some(&m1.id)));
    }

    #[tokio::test]
    async fn test_move_without_target() {
        let f = fixture();
        add_member(&f.store, "m1", Resources::new(4000, 8 << 30)).await;
        let placement = f.placer.place(instance("web", None, 100)).await.unwrap();

        let err = f
            .placer
            .relocate(MoveRequest::new(placement.resource_id), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(err.is_no_target());
    }
}
