//! Migration transport.
//!
//! Moves an instance's disk (and, for live migration, its memory) from a
//! source member to a target member:
//!
//! 1. Pick a transfer mode from endpoint reachability ([`selector`])
//! 2. Stream disk chunks, directly or through a bounded relay buffer
//! 3. For live migration, run iterative memory pre-copy until the synced
//!    fraction reaches the goal or the iteration cap, then a final dump
//! 4. Commit the handoff on the target
//!
//! Cancellation is checked at every chunk and dump boundary. Any failure
//! aborts the target and resumes the source, which stays authoritative.
//! The caller moves the store's host pointer only after [`Transport::transfer`]
//! returns a [`Handoff`], then releases or rolls it back.

mod peer;
mod registry;
mod selector;

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use drover_events::{
    event_types, AggregateType, MigrationFinishedPayload, MigrationStartedPayload, TransferMode,
};
use drover_id::{MigrationId, OperationId, ResourceId};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::events::EventBus;
use crate::network::{endpoint, NetworkResolver};
use crate::operations::CancelToken;
use crate::store::{Member, Resource};

pub use peer::{
    MemoryDump, MemoryPeer, MemoryPeerDirectory, MigrationPeer, PeerDirectory, TransportError,
};
pub use registry::{MigrationPhase, MigrationRegistry, MigrationSession};
pub use selector::{choose_mode, select_mode};

/// Hard cap on pre-copy iterations regardless of configuration.
pub const MAX_PRECOPY_ITERATIONS: u32 = 999;

/// Transfer tuning.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    /// Chunks buffered between source and target in relay mode.
    pub relay_buffer: usize,
    /// Synced fraction of memory at which pre-copy stops.
    pub precopy_goal: f64,
    pub precopy_max_iterations: u32,
    pub preferred_mode: Option<TransferMode>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            relay_buffer: 8,
            precopy_goal: 0.70,
            precopy_max_iterations: 10,
            preferred_mode: None,
        }
    }
}

impl TransferSettings {
    fn max_iterations(&self) -> u32 {
        self.precopy_max_iterations.clamp(1, MAX_PRECOPY_ITERATIONS)
    }
}

/// What to move and where.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub resource: &'a Resource,
    pub source: &'a Member,
    pub target: &'a Member,
    pub live: bool,
    pub operation_id: Option<OperationId>,
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub migration_id: MigrationId,
    pub mode: TransferMode,
    pub live: bool,
    pub bytes_transferred: u64,
    pub precopy_iterations: u32,
}

/// A transfer the target has committed. The source still holds its copy.
pub struct Handoff {
    report: TransferReport,
    resource: ResourceId,
    operation_id: Option<OperationId>,
    source: Arc<dyn MigrationPeer>,
    target: Arc<dyn MigrationPeer>,
    events: EventBus,
}

impl Handoff {
    pub fn report(&self) -> &TransferReport {
        &self.report
    }

    /// Frees the source copy. Call once the store records the new host.
    pub async fn release(self) -> TransferReport {
        if let Err(e) = self.source.release(&self.resource).await {
            warn!(resource = %self.resource, error = %e, "Source failed to release migrated resource");
        }
        publish_finished(&self.events, &self.report, self.resource, self.operation_id, None);
        self.report
    }

    /// Discards the target copy and resumes the source.
    pub async fn rollback(self, reason: &str) {
        rollback_peers(&self.source, &self.target, &self.resource).await;
        publish_finished(
            &self.events,
            &self.report,
            self.resource,
            self.operation_id,
            Some(reason.to_string()),
        );
    }
}

/// Runs migrations between members.
#[derive(Clone)]
pub struct Transport {
    network: Arc<dyn NetworkResolver>,
    peers: Arc<dyn PeerDirectory>,
    registry: MigrationRegistry,
    events: EventBus,
    settings: TransferSettings,
}

impl Transport {
    pub fn new(
        network: Arc<dyn NetworkResolver>,
        peers: Arc<dyn PeerDirectory>,
        events: EventBus,
        settings: TransferSettings,
    ) -> Self {
        Self {
            network,
            peers,
            registry: MigrationRegistry::new(),
            events,
            settings,
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Moves `request.resource` from source to target up to the target commit.
    #[instrument(skip(self, request, cancel), fields(resource = %request.resource.id, live = request.live))]
    pub async fn transfer(
        &self,
        request: TransferRequest<'_>,
        cancel: &CancelToken,
    ) -> ClusterResult<Handoff> {
        let resource_id = request.resource.id;
        let source_address = endpoint(self.network.as_ref(), request.source).await;
        let target_address = endpoint(self.network.as_ref(), request.target).await;
        let mode = select_mode(
            self.network.as_ref(),
            &source_address,
            &target_address,
            self.settings.preferred_mode,
        )
        .await;

        let id = MigrationId::new();
        let session_token = self.registry.register(MigrationSession {
            id,
            resource_id,
            source: request.source.id,
            target: request.target.id,
            mode,
            live: request.live,
            phase: MigrationPhase::Connecting,
            bytes_transferred: 0,
            precopy_iterations: 0,
            operation_id: request.operation_id,
            started_at: Utc::now(),
        });

        info!(
            migration_id = %id,
            source = %request.source.name,
            target = %request.target.name,
            %mode,
            "Starting migration"
        );
        self.events.publish(
            AggregateType::Migration,
            id.to_string(),
            event_types::MIGRATION_STARTED,
            &MigrationStartedPayload {
                migration_id: id,
                resource_id,
                source: request.source.id,
                target: request.target.id,
                mode,
                live: request.live,
                operation_id: request.operation_id,
            },
            request.operation_id,
        );

        let peers = self
            .peers
            .peer(request.source)
            .and_then(|source| self.peers.peer(request.target).map(|target| (source, target)));
        let (source, target) = match peers {
            Ok(peers) => peers,
            Err(e) => {
                self.registry.finish(&id);
                let report = TransferReport {
                    migration_id: id,
                    mode,
                    live: request.live,
                    bytes_transferred: 0,
                    precopy_iterations: 0,
                };
                publish_finished(&self.events, &report, resource_id, request.operation_id, Some(e.to_string()));
                return Err(ClusterError::TransferFailed(e.to_string()));
            }
        };

        let progress = Progress {
            registry: &self.registry,
            id,
            cancel,
            session: &session_token,
        };
        let outcome = self
            .run(&progress, mode, request.live, &resource_id, &source, &target)
            .await;

        let (bytes_transferred, precopy_iterations) = self
            .registry
            .finish(&id)
            .map(|s| (s.bytes_transferred, s.precopy_iterations))
            .unwrap_or_default();
        let report = TransferReport {
            migration_id: id,
            mode,
            live: request.live,
            bytes_transferred,
            precopy_iterations,
        };

        match outcome {
            Ok(()) => {
                info!(
                    migration_id = %id,
                    bytes_transferred,
                    precopy_iterations,
                    "Target committed migration"
                );
                Ok(Handoff {
                    report,
                    resource: resource_id,
                    operation_id: request.operation_id,
                    source,
                    target,
                    events: self.events.clone(),
                })
            }
            Err(e) => {
                warn!(migration_id = %id, error = %e, "Migration failed, resuming source");
                rollback_peers(&source, &target, &resource_id).await;
                publish_finished(&self.events, &report, resource_id, request.operation_id, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        progress: &Progress<'_>,
        mode: TransferMode,
        live: bool,
        resource: &ResourceId,
        source: &Arc<dyn MigrationPeer>,
        target: &Arc<dyn MigrationPeer>,
    ) -> ClusterResult<()> {
        progress.phase(MigrationPhase::Disk);
        match mode {
            TransferMode::Relay => self.relay_disk(progress, resource, source, target).await?,
            TransferMode::Pull | TransferMode::Push => {
                self.stream_disk(progress, resource, source, target).await?
            }
        }

        if live {
            progress.phase(MigrationPhase::PreCopy);
            let max_iterations = self.settings.max_iterations();
            let mut iteration = 0;
            while iteration < max_iterations {
                progress.check()?;
                let dump = source
                    .dump_memory(resource, iteration, false)
                    .await
                    .map_err(transfer_failed)?;
                let synced = dump.synced_fraction();
                let len = dump.data.len() as u64;
                target
                    .apply_memory(resource, dump)
                    .await
                    .map_err(transfer_failed)?;

                iteration += 1;
                progress.add(len, Some(iteration));
                debug!(%resource, iteration, synced, "Pre-copy iteration complete");

                if synced >= self.settings.precopy_goal {
                    break;
                }
            }

            progress.phase(MigrationPhase::FinalDump);
            progress.check()?;
            let dump = source
                .dump_memory(resource, iteration, true)
                .await
                .map_err(transfer_failed)?;
            let len = dump.data.len() as u64;
            target
                .apply_memory(resource, dump)
                .await
                .map_err(transfer_failed)?;
            progress.add(len, None);
        }

        progress.phase(MigrationPhase::Handoff);
        progress.check()?;
        target.commit(resource).await.map_err(transfer_failed)
    }

    async fn stream_disk(
        &self,
        progress: &Progress<'_>,
        resource: &ResourceId,
        source: &Arc<dyn MigrationPeer>,
        target: &Arc<dyn MigrationPeer>,
    ) -> ClusterResult<()> {
        let mut offset = 0u64;
        loop {
            progress.check()?;
            let Some(chunk) = source
                .read_disk_chunk(resource, offset, self.settings.chunk_size)
                .await
                .map_err(transfer_failed)?
            else {
                return Ok(());
            };

            let len = chunk.len() as u64;
            target
                .write_disk_chunk(resource, offset, chunk)
                .await
                .map_err(transfer_failed)?;
            offset += len;
            progress.add(len, None);
        }
    }

    async fn relay_disk(
        &self,
        progress: &Progress<'_>,
        resource: &ResourceId,
        source: &Arc<dyn MigrationPeer>,
        target: &Arc<dyn MigrationPeer>,
    ) -> ClusterResult<()> {
        let (tx, mut rx) = mpsc::channel::<(u64, Bytes)>(self.settings.relay_buffer.max(1));
        let chunk_size = self.settings.chunk_size;

        let reader = async move {
            let mut offset = 0u64;
            loop {
                progress.check()?;
                let Some(chunk) = source
                    .read_disk_chunk(resource, offset, chunk_size)
                    .await
                    .map_err(transfer_failed)?
                else {
                    return Ok::<(), ClusterError>(());
                };

                let len = chunk.len() as u64;
                if tx.send((offset, chunk)).await.is_err() {
                    return Err(ClusterError::TransferFailed(
                        "relay writer stopped".to_string(),
                    ));
                }
                offset += len;
            }
        };

        let writer = async {
            while let Some((offset, chunk)) = rx.recv().await {
                progress.check()?;
                let len = chunk.len() as u64;
                target
                    .write_disk_chunk(resource, offset, chunk)
                    .await
                    .map_err(transfer_failed)?;
                progress.add(len, None);
            }
            Ok::<(), ClusterError>(())
        };

        tokio::try_join!(reader, writer)?;
        Ok(())
    }
}

struct Progress<'a> {
    registry: &'a MigrationRegistry,
    id: MigrationId,
    cancel: &'a CancelToken,
    session: &'a CancelToken,
}

impl Progress<'_> {
    fn check(&self) -> ClusterResult<()> {
        self.cancel.check()?;
        self.session.check()
    }

    fn phase(&self, phase: MigrationPhase) {
        self.registry.update(&self.id, |s| s.phase = phase);
    }

    fn add(&self, bytes: u64, iterations: Option<u32>) {
        self.registry.update(&self.id, |s| {
            s.bytes_transferred += bytes;
            if let Some(n) = iterations {
                s.precopy_iterations = n;
            }
        });
    }
}

fn transfer_failed(e: TransportError) -> ClusterError {
    ClusterError::TransferFailed(e.to_string())
}

async fn rollback_peers(
    source: &Arc<dyn MigrationPeer>,
    target: &Arc<dyn MigrationPeer>,
    resource: &ResourceId,
) {
    if let Err(e) = target.abort(resource).await {
        warn!(%resource, error = %e, "Target failed to abort migration");
    }
    if let Err(e) = source.resume(resource).await {
        warn!(%resource, error = %e, "Source failed to resume after migration");
    }
}

fn publish_finished(
    events: &EventBus,
    report: &TransferReport,
    resource_id: ResourceId,
    operation_id: Option<OperationId>,
    error: Option<String>,
) {
    events.publish(
        AggregateType::Migration,
        report.migration_id.to_string(),
        event_types::MIGRATION_FINISHED,
        &MigrationFinishedPayload {
            migration_id: report.migration_id,
            resource_id,
            committed: error.is_none(),
            bytes_transferred: report.bytes_transferred,
            precopy_iterations: report.precopy_iterations,
            error,
        },
        operation_id,
    );
}
