//! Evacuation and restore orchestration.
//!
//! Evacuation empties a member before maintenance. The member is switched to
//! `evacuating` first, so it stops receiving placements, then every hosted
//! resource is handled according to the [`EvacuationMode`]:
//!
//! | mode           | running instance                 | local volume |
//! |----------------|----------------------------------|--------------|
//! | `stop`         | stopped in place                 | left         |
//! | `freeze`       | frozen in place                  | left         |
//! | `migrate`      | stopped, moved, started again    | moved        |
//! | `live-migrate` | live-moved if eligible, else stopped | moved    |
//! | `auto`         | per the resource's evacuate policy | per policy |
//!
//! Under `auto`, a resource with the default policy is live-moved when it is
//! running and eligible and cold-moved otherwise.
//!
//! Each touched resource gets an [`EvacuationMark`] recording where it came
//! from and its prior power state. Restore consumes the marks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drover_events::{
    event_types, AggregateType, EvacuationCompletedPayload, EvacuationMode, MemberStatus,
    PowerState, ResourceKind, RestoreCompletedPayload,
};
use drover_id::{MemberId, OperationId, ResourceId};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::events::EventBus;
use crate::membership::Membership;
use crate::network::{endpoint, NetworkResolver};
use crate::operations::CancelToken;
use crate::placement::{MarkChange, MoveRequest, Placer};
use crate::runtime::{apply_action, ResourceRuntime, RuntimeAction};
use crate::store::{EvacuationAction, EvacuationMark, Member, Resource, StoreHandle, TargetScope};

/// Evacuation tuning.
#[derive(Debug, Clone, Copy)]
pub struct EvacuationSettings {
    /// Resources handled at the same time.
    pub concurrency: usize,
    /// Mark the member evacuated even if some resources failed.
    pub tolerate_failures: bool,
    /// Move migrated resources back on restore.
    pub return_migrated: bool,
    /// Offline time after which the sweeper heals a member. Zero disables healing.
    pub healing_threshold: Duration,
}

impl Default for EvacuationSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            tolerate_failures: false,
            return_migrated: false,
            healing_threshold: Duration::ZERO,
        }
    }
}

/// What restore did to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreAction {
    /// Started or unfrozen on the restored member.
    Resumed,
    /// Migrated back to the restored member.
    Returned,
    /// Mark cleared, nothing else to do.
    Cleared,
}

/// Outcome for one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome<A> {
    pub resource_id: ResourceId,
    pub name: String,
    pub kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<A>,
    /// Member the resource moved to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<A> ResourceOutcome<A> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregated result of an evacuation.
#[derive(Debug, Clone, Serialize)]
pub struct EvacuationReport {
    pub member_id: MemberId,
    pub member: String,
    pub mode: EvacuationMode,
    pub status: MemberStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<ResourceOutcome<EvacuationAction>>,
}

/// Aggregated result of a restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub member_id: MemberId,
    pub member: String,
    pub resumed: usize,
    pub returned: usize,
    pub failed: usize,
    pub outcomes: Vec<ResourceOutcome<RestoreAction>>,
}

struct Done<A> {
    action: A,
    target: Option<String>,
    detail: Option<String>,
}

impl<A> Done<A> {
    fn new(action: A) -> Self {
        Self {
            action,
            target: None,
            detail: None,
        }
    }
}

fn outcome<A>(resource: &Resource, result: ClusterResult<Done<A>>) -> ResourceOutcome<A> {
    let base = ResourceOutcome {
        resource_id: resource.id,
        name: resource.name.clone(),
        kind: resource.kind,
        action: None,
        target: None,
        detail: None,
        error: None,
    };
    match result {
        Ok(done) => ResourceOutcome {
            action: Some(done.action),
            target: done.target,
            detail: done.detail,
            ..base
        },
        Err(e) => ResourceOutcome {
            error: Some(e.to_string()),
            ..base
        },
    }
}

/// Runs evacuations and restores.
#[derive(Clone)]
pub struct Orchestrator {
    store: StoreHandle,
    membership: Membership,
    placer: Placer,
    runtime: Arc<dyn ResourceRuntime>,
    network: Arc<dyn NetworkResolver>,
    events: EventBus,
    settings: EvacuationSettings,
}

impl Orchestrator {
    pub fn new(
        store: StoreHandle,
        membership: Membership,
        placer: Placer,
        runtime: Arc<dyn ResourceRuntime>,
        network: Arc<dyn NetworkResolver>,
        events: EventBus,
        settings: EvacuationSettings,
    ) -> Self {
        Self {
            store,
            membership,
            placer,
            runtime,
            network,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &EvacuationSettings {
        &self.settings
    }

    async fn probe(&self, member: &Member) -> ClusterResult<()> {
        let address = endpoint(self.network.as_ref(), member).await;
        self.network
            .probe(&address)
            .await
            .map_err(|e| ClusterError::MemberUnreachable(format!("{}: {e}", member.name)))
    }

    /// Empties `name` according to `mode`.
    ///
    /// Resources already handled by an earlier attempt are skipped while
    /// their power state still matches the mark, so a partially failed
    /// evacuation can simply be run again.
    #[instrument(skip(self, cancel), fields(operation_id = ?operation_id))]
    pub async fn evacuate(
        &self,
        name: &str,
        mode: EvacuationMode,
        operation_id: Option<OperationId>,
        cancel: &CancelToken,
    ) -> ClusterResult<EvacuationReport> {
        self.drain(name, mode, false, operation_id, cancel).await
    }

    /// Moves resources off a member that stopped heartbeating.
    ///
    /// The member is not probed first; only `offline` members are accepted.
    #[instrument(skip(self, cancel), fields(operation_id = ?operation_id))]
    pub async fn heal(
        &self,
        name: &str,
        operation_id: Option<OperationId>,
        cancel: &CancelToken,
    ) -> ClusterResult<EvacuationReport> {
        self.drain(name, EvacuationMode::Migrate, true, operation_id, cancel)
            .await
    }

    async fn drain(
        &self,
        name: &str,
        mode: EvacuationMode,
        healing: bool,
        operation_id: Option<OperationId>,
        cancel: &CancelToken,
    ) -> ClusterResult<EvacuationReport> {
        let from: &[MemberStatus] = if healing {
            &[MemberStatus::Offline]
        } else {
            &[
                MemberStatus::Online,
                MemberStatus::Offline,
                MemberStatus::Evacuating,
            ]
        };
        let member = self.membership.get_by_name(name).await?;
        let (member, _) = self
            .membership
            .transition(&member.id, from, MemberStatus::Evacuating)
            .await?;
        if !healing {
            self.probe(&member).await?;
        }

        let snapshot = self.store.read().await?;
        let pending: Vec<Resource> = snapshot
            .hosted_resources(&member.id)
            .filter(|r| match r.evacuation {
                Some(mark) => mark.origin != member.id || !mark.still_applies(r.power_state),
                None => true,
            })
            .cloned()
            .collect();
        drop(snapshot);
        info!(member = %member.name, %mode, healing, resources = pending.len(), "Starting evacuation");

        let unreachable = AtomicBool::new(false);
        let outcomes: Vec<ResourceOutcome<EvacuationAction>> = stream::iter(pending)
            .map(|resource| {
                let member = &member;
                let unreachable = &unreachable;
                async move {
                    if cancel.is_cancelled() || unreachable.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = self
                        .evacuate_resource(member, &resource, mode, operation_id)
                        .await;
                    if let Err(ClusterError::MemberUnreachable(_)) = &result {
                        unreachable.store(true, Ordering::SeqCst);
                    }
                    if let Err(e) = &result {
                        warn!(resource = %resource.name, error = %e, "Failed to evacuate resource");
                    }
                    Some(outcome(&resource, result))
                }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .filter_map(|o| async move { o })
            .collect()
            .await;

        if unreachable.load(Ordering::SeqCst) {
            return Err(ClusterError::MemberUnreachable(format!(
                "{} became unreachable during evacuation",
                member.name
            )));
        }
        cancel.check()?;

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        let succeeded = outcomes.len() - failed;
        let status = if failed == 0 || self.settings.tolerate_failures {
            self.membership
                .transition(&member.id, &[MemberStatus::Evacuating], MemberStatus::Evacuated)
                .await?
                .0
                .status
        } else {
            MemberStatus::Evacuating
        };

        info!(member = %member.name, succeeded, failed, %status, "Evacuation finished");
        self.events.publish(
            AggregateType::Member,
            member.id.to_string(),
            event_types::EVACUATION_COMPLETED,
            &EvacuationCompletedPayload {
                member_id: member.id,
                mode,
                succeeded,
                failed,
                member_status: status,
            },
            operation_id,
        );

        Ok(EvacuationReport {
            member_id: member.id,
            member: member.name,
            mode,
            status,
            succeeded,
            failed,
            outcomes,
        })
    }

    async fn evacuate_resource(
        &self,
        member: &Member,
        resource: &Resource,
        mode: EvacuationMode,
        operation_id: Option<OperationId>,
    ) -> ClusterResult<Done<EvacuationAction>> {
        let mode = match mode {
            EvacuationMode::Auto => resource
                .evacuate_policy
                .resolve(resource.is_running() && resource.live_migration.is_eligible()),
            mode => mode,
        };
        let migrating = matches!(mode, EvacuationMode::Migrate | EvacuationMode::LiveMigrate);

        if resource.kind == ResourceKind::Volume {
            return if migrating {
                self.migrate(member, resource, false, operation_id).await
            } else {
                self.mark_in_place(member, resource, None, EvacuationAction::LeftInPlace)
                    .await
            };
        }

        match mode {
            EvacuationMode::Stop => self.stop_in_place(member, resource, None).await,
            EvacuationMode::Freeze if resource.is_running() => {
                self.mark_in_place(
                    member,
                    resource,
                    Some(RuntimeAction::Freeze),
                    EvacuationAction::Frozen,
                )
                .await
            }
            EvacuationMode::Freeze => {
                self.mark_in_place(member, resource, None, EvacuationAction::LeftInPlace)
                    .await
            }
            EvacuationMode::LiveMigrate
                if resource.is_running() && resource.live_migration.is_eligible() =>
            {
                self.migrate(member, resource, true, operation_id).await
            }
            EvacuationMode::LiveMigrate => {
                self.stop_in_place(
                    member,
                    resource,
                    Some("not eligible for live migration".to_string()),
                )
                .await
            }
            EvacuationMode::Migrate | EvacuationMode::Auto => {
                self.migrate(member, resource, false, operation_id).await
            }
        }
    }

    async fn migrate(
        &self,
        member: &Member,
        resource: &Resource,
        live: bool,
        operation_id: Option<OperationId>,
    ) -> ClusterResult<Done<EvacuationAction>> {
        let action = if live {
            EvacuationAction::LiveMigrated
        } else {
            EvacuationAction::Migrated
        };
        let request = MoveRequest {
            resource_id: resource.id,
            scope: None,
            live,
            allow_restoring: false,
            mark: MarkChange::Set(EvacuationMark {
                origin: member.id,
                action,
                prior_power: resource.power_state,
            }),
            operation_id,
        };

        match self.placer.relocate(request, &CancelToken::never()).await {
            Ok(moved) => Ok(Done {
                action,
                target: Some(moved.to_name),
                detail: moved
                    .start_error
                    .map(|e| format!("not started on target: {e}")),
            }),
            Err(e) if e.is_no_target() => {
                let reason = format!("no eligible target: {e}");
                if resource.kind == ResourceKind::Volume {
                    let mut done = self
                        .mark_in_place(member, resource, None, EvacuationAction::LeftInPlace)
                        .await?;
                    done.detail = Some(reason);
                    Ok(done)
                } else {
                    self.stop_in_place(member, resource, Some(reason)).await
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn stop_in_place(
        &self,
        member: &Member,
        resource: &Resource,
        reason: Option<String>,
    ) -> ClusterResult<Done<EvacuationAction>> {
        let mut done = if resource.is_running() {
            self.mark_in_place(
                member,
                resource,
                Some(RuntimeAction::Stop),
                EvacuationAction::Stopped,
            )
            .await?
        } else {
            self.mark_in_place(member, resource, None, EvacuationAction::LeftInPlace)
                .await?
        };
        done.detail = reason;
        Ok(done)
    }

    /// Applies `runtime_action` (if any) and records the evacuation mark.
    async fn mark_in_place(
        &self,
        member: &Member,
        resource: &Resource,
        runtime_action: Option<RuntimeAction>,
        action: EvacuationAction,
    ) -> ClusterResult<Done<EvacuationAction>> {
        let power_state = match runtime_action {
            Some(runtime_action) => {
                apply_action(self.runtime.as_ref(), runtime_action, member, resource).await?;
                match runtime_action {
                    RuntimeAction::Freeze => PowerState::Frozen,
                    RuntimeAction::Stop => PowerState::Stopped,
                    RuntimeAction::Start | RuntimeAction::Unfreeze => PowerState::Running,
                }
            }
            None => resource.power_state,
        };
        let mark = EvacuationMark {
            origin: member.id,
            action,
            prior_power: resource.power_state,
        };
        self.placer
            .update_resource(&resource.id, |r| {
                r.power_state = power_state;
                r.evacuation = Some(mark);
            })
            .await?;
        Ok(Done::new(action))
    }

    /// Brings `name` back into service.
    #[instrument(skip(self, cancel), fields(operation_id = ?operation_id))]
    pub async fn restore(
        &self,
        name: &str,
        operation_id: Option<OperationId>,
        cancel: &CancelToken,
    ) -> ClusterResult<RestoreReport> {
        let member = self.membership.get_by_name(name).await?;
        let (member, _) = self
            .membership
            .transition(
                &member.id,
                &[MemberStatus::Evacuated, MemberStatus::Evacuating],
                MemberStatus::Restoring,
            )
            .await?;
        if let Err(e) = self.probe(&member).await {
            self.revert_restore(&member.id).await?;
            return Err(e);
        }

        let snapshot = self.store.read().await?;
        let marked: Vec<Resource> = snapshot
            .resources
            .values()
            .filter(|r| r.evacuation.is_some_and(|mark| mark.origin == member.id))
            .cloned()
            .collect();
        drop(snapshot);
        info!(member = %member.name, resources = marked.len(), "Starting restore");

        let unreachable = AtomicBool::new(false);
        let outcomes: Vec<ResourceOutcome<RestoreAction>> = stream::iter(marked)
            .map(|resource| {
                let member = &member;
                let unreachable = &unreachable;
                async move {
                    if cancel.is_cancelled() || unreachable.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = self.restore_resource(member, &resource, operation_id).await;
                    if let Err(ClusterError::MemberUnreachable(_)) = &result {
                        unreachable.store(true, Ordering::SeqCst);
                    }
                    if let Err(e) = &result {
                        warn!(resource = %resource.name, error = %e, "Failed to restore resource");
                    }
                    Some(outcome(&resource, result))
                }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .filter_map(|o| async move { o })
            .collect()
            .await;

        if unreachable.load(Ordering::SeqCst) {
            self.revert_restore(&member.id).await?;
            return Err(ClusterError::MemberUnreachable(format!(
                "{} became unreachable during restore",
                member.name
            )));
        }
        if cancel.is_cancelled() {
            self.revert_restore(&member.id).await?;
            return Err(ClusterError::Cancelled);
        }

        let count = |action| {
            outcomes
                .iter()
                .filter(|o| o.action == Some(action))
                .count()
        };
        let resumed = count(RestoreAction::Resumed);
        let returned = count(RestoreAction::Returned);
        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();

        self.membership
            .transition(&member.id, &[MemberStatus::Restoring], MemberStatus::Online)
            .await?;

        info!(member = %member.name, resumed, returned, failed, "Restore finished");
        self.events.publish(
            AggregateType::Member,
            member.id.to_string(),
            event_types::RESTORE_COMPLETED,
            &RestoreCompletedPayload {
                member_id: member.id,
                resumed,
                returned,
                failed,
            },
            operation_id,
        );

        Ok(RestoreReport {
            member_id: member.id,
            member: member.name,
            resumed,
            returned,
            failed,
            outcomes,
        })
    }

    async fn revert_restore(&self, member: &MemberId) -> ClusterResult<()> {
        self.membership
            .transition(member, &[MemberStatus::Restoring], MemberStatus::Evacuated)
            .await?;
        Ok(())
    }

    async fn restore_resource(
        &self,
        member: &Member,
        resource: &Resource,
        operation_id: Option<OperationId>,
    ) -> ClusterResult<Done<RestoreAction>> {
        let Some(mark) = resource.evacuation else {
            return Ok(Done::new(RestoreAction::Cleared));
        };

        if resource.host != Some(member.id) {
            if !self.settings.return_migrated {
                self.placer
                    .update_resource(&resource.id, |r| r.evacuation = None)
                    .await?;
                return Ok(Done::new(RestoreAction::Cleared));
            }

            let live = mark.action == EvacuationAction::LiveMigrated
                && resource.is_running()
                && resource.live_migration.is_eligible();
            let request = MoveRequest {
                resource_id: resource.id,
                scope: Some(TargetScope::Member(member.name.clone())),
                live,
                allow_restoring: true,
                mark: MarkChange::Clear,
                operation_id,
            };
            let moved = self.placer.relocate(request, &CancelToken::never()).await?;
            return Ok(Done {
                action: RestoreAction::Returned,
                target: Some(moved.to_name),
                detail: moved.start_error,
            });
        }

        let resume = match (mark.prior_power, resource.power_state) {
            (PowerState::Running, PowerState::Frozen) => Some(RuntimeAction::Unfreeze),
            (PowerState::Running, PowerState::Stopped) => Some(RuntimeAction::Start),
            _ => None,
        };
        match resume {
            Some(action) => {
                apply_action(self.runtime.as_ref(), action, member, resource).await?;
                self.placer
                    .update_resource(&resource.id, |r| {
                        r.power_state = PowerState::Running;
                        r.evacuation = None;
                    })
                    .await?;
                Ok(Done::new(RestoreAction::Resumed))
            }
            None => {
                self.placer
                    .update_resource(&resource.id, |r| r.evacuation = None)
                    .await?;
                Ok(Done::new(RestoreAction::Cleared))
            }
        }
    }
}
