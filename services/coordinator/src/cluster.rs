//! Wiring of the coordination components around one store.

use std::sync::Arc;

use crate::events::EventBus;
use crate::evacuation::{EvacuationSettings, Orchestrator};
use crate::join::{JoinCoordinator, JoinSettings};
use crate::membership::{Membership, MembershipSettings};
use crate::migration::{MemoryPeerDirectory, PeerDirectory, TransferSettings, Transport};
use crate::network::{NetworkResolver, StaticNetwork};
use crate::operations::OperationRegistry;
use crate::placement::{PlacementSettings, Placer};
use crate::runtime::{MockRuntime, ResourceRuntime};
use crate::storage::{MemoryStorage, StorageBackend};
use crate::store::{ClusterStore, StoreError, StoreHandle};

/// External systems the coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ResourceRuntime>,
    pub storage: Arc<dyn StorageBackend>,
    pub network: Arc<dyn NetworkResolver>,
    pub peers: Arc<dyn PeerDirectory>,
}

impl Collaborators {
    /// In-process implementations, for dev mode and tests.
    pub fn in_memory() -> Self {
        Self {
            runtime: Arc::new(MockRuntime::new()),
            storage: Arc::new(MemoryStorage::new()),
            network: Arc::new(StaticNetwork::new()),
            peers: Arc::new(MemoryPeerDirectory::new()),
        }
    }
}

/// Settings for every component.
#[derive(Debug, Clone, Default)]
pub struct ClusterSettings {
    pub membership: MembershipSettings,
    pub join: JoinSettings,
    pub placement: PlacementSettings,
    pub evacuation: EvacuationSettings,
    pub transfer: TransferSettings,
}

/// All coordination components sharing one store and event bus.
#[derive(Clone)]
pub struct Cluster {
    store: StoreHandle,
    events: EventBus,
    operations: OperationRegistry,
    membership: Membership,
    join: JoinCoordinator,
    placer: Placer,
    transport: Transport,
    orchestrator: Orchestrator,
}

impl Cluster {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        collaborators: Collaborators,
        settings: ClusterSettings,
    ) -> Self {
        let store = StoreHandle::new(store);
        let events = EventBus::new();
        let Collaborators {
            runtime,
            storage,
            network,
            peers,
        } = collaborators;

        let membership = Membership::new(
            store.clone(),
            network.clone(),
            events.clone(),
            settings.membership,
        );
        let join = JoinCoordinator::new(
            store.clone(),
            membership.clone(),
            network.clone(),
            events.clone(),
            settings.join,
        );
        let transport = Transport::new(network.clone(), peers, events.clone(), settings.transfer);
        let placer = Placer::new(
            store.clone(),
            storage,
            runtime.clone(),
            transport.clone(),
            events.clone(),
            settings.placement,
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            membership.clone(),
            placer.clone(),
            runtime,
            network,
            events.clone(),
            settings.evacuation,
        );

        Self {
            store,
            events,
            operations: OperationRegistry::new(),
            membership,
            join,
            placer,
            transport,
            orchestrator,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn join(&self) -> &JoinCoordinator {
        &self.join
    }

    pub fn placement(&self) -> &Placer {
        &self.placer
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.store.health_check().await
    }
}
