//! Instance runtime interface and mock implementation.
//!
//! The runtime drives instance power transitions on a member:
//! - stop / start
//! - freeze / unfreeze
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use drover_id::{MemberId, ResourceId};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{Member, Resource};

/// Errors from runtime calls.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The member could not be contacted at all.
    #[error("member {0} unreachable")]
    Unreachable(String),

    /// The member answered but the action failed.
    #[error("{0}")]
    Failed(String),
}

/// Power action requested from a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeAction {
    Start,
    Stop,
    Freeze,
    Unfreeze,
}

impl std::fmt::Display for RuntimeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeAction::Start => "start",
            RuntimeAction::Stop => "stop",
            RuntimeAction::Freeze => "freeze",
            RuntimeAction::Unfreeze => "unfreeze",
        };
        f.write_str(s)
    }
}

/// Instance runtime interface.
#[async_trait]
pub trait ResourceRuntime: Send + Sync {
    async fn start(&self, member: &Member, resource: &Resource) -> Result<(), RuntimeError>;

    async fn stop(&self, member: &Member, resource: &Resource) -> Result<(), RuntimeError>;

    async fn freeze(&self, member: &Member, resource: &Resource) -> Result<(), RuntimeError>;

    async fn unfreeze(&self, member: &Member, resource: &Resource) -> Result<(), RuntimeError>;
}

/// Applies `action` through `runtime`.
pub async fn apply_action(
    runtime: &dyn ResourceRuntime,
    action: RuntimeAction,
    member: &Member,
    resource: &Resource,
) -> Result<(), RuntimeError> {
    match action {
        RuntimeAction::Start => runtime.start(member, resource).await,
        RuntimeAction::Stop => runtime.stop(member, resource).await,
        RuntimeAction::Freeze => runtime.freeze(member, resource).await,
        RuntimeAction::Unfreeze => runtime.unfreeze(member, resource).await,
    }
}

/// A call recorded by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    pub action: RuntimeAction,
    pub member: MemberId,
    pub resource: ResourceId,
}

/// Mock runtime for testing and development.
#[derive(Default)]
pub struct MockRuntime {
    counter: AtomicU64,
    failing: Mutex<HashSet<ResourceId>>,
    unreachable: Mutex<HashSet<MemberId>>,
    calls: Mutex<Vec<RuntimeCall>>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every action on `resource` fail.
    pub fn fail_on(&self, resource: ResourceId) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource);
    }

    /// Make every action on `member` report it unreachable.
    pub fn set_unreachable(&self, member: MemberId) {
        self.unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(member);
    }

    /// Calls that succeeded, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of actions attempted, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn perform(
        &self,
        action: RuntimeAction,
        member: &Member,
        resource: &Resource,
    ) -> Result<(), RuntimeError> {
        self.counter.fetch_add(1, Ordering::SeqCst);

        if self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&member.id)
        {
            return Err(RuntimeError::Unreachable(member.name.clone()));
        }

        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&resource.id)
        {
            return Err(RuntimeError::Failed(format!(
                "mock runtime configured to fail {action} of {}",
                resource.name
            )));
        }

        info!(
            member = %member.name,
            resource = %resource.name,
            %action,
            "[MOCK] Applying runtime action"
        );
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RuntimeCall {
                action,
                member: member.id,
                resource: resource.id,
            });
        debug!(resource = %resource.id, %action, "[MOCK] Runtime action done");
        Ok(())
    }
}

#[async_trait]
impl ResourceRuntime for MockRuntime {
    async fn start(&self, member: &Member, resource: &Resource) -> Result<(), RuntimeError> {
        self.perform(RuntimeAction::Start, member, resource)
    }

    async fn stop(&self, member: &Member, resource: &Resource) -> Result<(), RuntimeError> {
        self.perform(RuntimeAction::Stop, member, resource)
    }

    async fn freeze(&self, member: &Member, resource: &Resource) -> Result<(), RuntimeError> {
        self.perform(RuntimeAction::Freeze, member, resource)
    }

    async fn unfreeze(&self, member: &Member, resource: &Resource) -> Result<(), RuntimeError> {
        self.perform(RuntimeAction::Unfreeze, member, resource)
    }
}
