//! Member data plane used by migrations.
//!
//! A migration reads disk chunks and memory dumps from the source member and
//! writes them to the target member, then asks the target to commit the
//! handoff. On failure the target aborts and the source resumes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use drover_id::{MemberId, ResourceId};
use thiserror::Error;
use tracing::debug;

use crate::store::Member;

/// Errors from the member data plane.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to {0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("rejected by peer: {0}")]
    Rejected(String),
}

/// One memory dump taken from the source.
#[derive(Debug, Clone)]
pub struct MemoryDump {
    pub iteration: u32,
    pub pages_total: u64,
    /// Pages unchanged since the previous dump.
    pub pages_skipped: u64,
    pub data: Bytes,
}

impl MemoryDump {
    /// Fraction of memory already in sync on the target.
    pub fn synced_fraction(&self) -> f64 {
        if self.pages_total == 0 {
            return 1.0;
        }
        self.pages_skipped as f64 / self.pages_total as f64
    }
}

/// Per-member data plane.
#[async_trait]
pub trait MigrationPeer: Send + Sync {
    /// Reads up to `max_len` bytes of the resource's disk at `offset`. `None` at end of disk.
    async fn read_disk_chunk(
        &self,
        resource: &ResourceId,
        offset: u64,
        max_len: usize,
    ) -> Result<Option<Bytes>, TransportError>;

    async fn write_disk_chunk(
        &self,
        resource: &ResourceId,
        offset: u64,
        data: Bytes,
    ) -> Result<(), TransportError>;

    /// Takes a memory dump. The final dump pauses the resource on the source.
    async fn dump_memory(
        &self,
        resource: &ResourceId,
        iteration: u32,
        final_dump: bool,
    ) -> Result<MemoryDump, TransportError>;

    async fn apply_memory(&self, resource: &ResourceId, dump: MemoryDump) -> Result<(), TransportError>;

    /// Target side: make the received copy authoritative.
    async fn commit(&self, resource: &ResourceId) -> Result<(), TransportError>;

    /// Target side: discard the received copy.
    async fn abort(&self, resource: &ResourceId) -> Result<(), TransportError>;

    /// Source side: continue as before after a failed or cancelled migration.
    async fn resume(&self, resource: &ResourceId) -> Result<(), TransportError>;

    /// Source side: free the local copy once the target owns the resource.
    async fn release(&self, resource: &ResourceId) -> Result<(), TransportError>;
}

/// Looks up the data plane of a member.
pub trait PeerDirectory: Send + Sync {
    fn peer(&self, member: &Member) -> Result<Arc<dyn MigrationPeer>, TransportError>;
}

const DEFAULT_DISK_BYTES: usize = 256 * 1024;
const PAGES_TOTAL: u64 = 1024;
const PAGE_BYTES: usize = 64;

#[derive(Default)]
struct PeerState {
    disks: HashMap<ResourceId, Bytes>,
    staged: HashMap<ResourceId, Vec<u8>>,
    memory_applied: HashMap<ResourceId, u32>,
    committed: HashSet<ResourceId>,
    aborted: HashSet<ResourceId>,
    resumed: HashSet<ResourceId>,
    released: HashSet<ResourceId>,
}

/// In-memory data plane for one member.
pub struct MemoryPeer {
    member: MemberId,
    state: Mutex<PeerState>,
    /// Fraction of pages that become in sync with each pre-copy iteration.
    convergence_step: f64,
    fail_commit: AtomicBool,
    fail_reads: AtomicBool,
    chunk_delay: Mutex<Option<Duration>>,
}

impl MemoryPeer {
    pub fn new(member: MemberId) -> Self {
        Self {
            member,
            state: Mutex::new(PeerState::default()),
            convergence_step: 0.25,
            fail_commit: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            chunk_delay: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the disk contents served for `resource`.
    pub fn seed_disk(&self, resource: ResourceId, data: Bytes) {
        self.state().disks.insert(resource, data);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Slows down every disk chunk read.
    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.chunk_delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Bytes received for `resource` and not yet aborted.
    pub fn received(&self, resource: &ResourceId) -> Option<Vec<u8>> {
        self.state().staged.get(resource).cloned()
    }

    pub fn memory_iterations(&self, resource: &ResourceId) -> u32 {
        self.state().memory_applied.get(resource).copied().unwrap_or(0)
    }

    pub fn is_committed(&self, resource: &ResourceId) -> bool {
        self.state().committed.contains(resource)
    }

    pub fn was_aborted(&self, resource: &ResourceId) -> bool {
        self.state().aborted.contains(resource)
    }

    pub fn was_resumed(&self, resource: &ResourceId) -> bool {
        self.state().resumed.contains(resource)
    }

    pub fn was_released(&self, resource: &ResourceId) -> bool {
        self.state().released.contains(resource)
    }

    fn disk(&self, resource: &ResourceId) -> Bytes {
        self.state()
            .disks
            .entry(*resource)
            .or_insert_with(|| Bytes::from(vec![0xA5u8; DEFAULT_DISK_BYTES]))
            .clone()
    }
}

#[async_trait]
impl MigrationPeer for MemoryPeer {
    async fn read_disk_chunk(
        &self,
        resource: &ResourceId,
        offset: u64,
        max_len: usize,
    ) -> Result<Option<Bytes>, TransportError> {
        let delay = *self.chunk_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::Io(format!("read failed on {}", self.member)));
        }

        let disk = self.disk(resource);
        let start = usize::try_from(offset).map_err(|_| TransportError::Io("offset overflow".into()))?;
        if start >= disk.len() {
            return Ok(None);
        }
        let end = disk.len().min(start.saturating_add(max_len.max(1)));
        Ok(Some(disk.slice(start..end)))
    }

    async fn write_disk_chunk(
        &self,
        resource: &ResourceId,
        offset: u64,
        data: Bytes,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let staged = state.staged.entry(*resource).or_default();
        if staged.len() as u64 != offset {
            return Err(TransportError::Rejected(format!(
                "out-of-order chunk at {offset}, have {}",
                staged.len()
            )));
        }
        staged.extend_from_slice(&data);
        Ok(())
    }

    async fn dump_memory(
        &self,
        resource: &ResourceId,
        iteration: u32,
        final_dump: bool,
    ) -> Result<MemoryDump, TransportError> {
        let synced = if final_dump {
            1.0
        } else {
            (f64::from(iteration) * self.convergence_step).min(1.0)
        };
        let pages_skipped = (PAGES_TOTAL as f64 * synced) as u64;
        let dirty = (PAGES_TOTAL - pages_skipped) as usize;
        debug!(%resource, iteration, final_dump, pages_skipped, "[MOCK] Memory dump");

        Ok(MemoryDump {
            iteration,
            pages_total: PAGES_TOTAL,
            pages_skipped,
            data: Bytes::from(vec![0x5Au8; dirty * PAGE_BYTES]),
        })
    }

    async fn apply_memory(&self, resource: &ResourceId, _dump: MemoryDump) -> Result<(), TransportError> {
        *self.state().memory_applied.entry(*resource).or_default() += 1;
        Ok(())
    }

    async fn commit(&self, resource: &ResourceId) -> Result<(), TransportError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("commit refused".to_string()));
        }
        self.state().committed.insert(*resource);
        Ok(())
    }

    async fn abort(&self, resource: &ResourceId) -> Result<(), TransportError> {
        let mut state = self.state();
        state.staged.remove(resource);
        state.committed.remove(resource);
        state.aborted.insert(*resource);
        Ok(())
    }

    async fn resume(&self, resource: &ResourceId) -> Result<(), TransportError> {
        self.state().resumed.insert(*resource);
        Ok(())
    }

    async fn release(&self, resource: &ResourceId) -> Result<(), TransportError> {
        let mut state = self.state();
        state.disks.remove(resource);
        state.released.insert(*resource);
        Ok(())
    }
}

/// Directory handing out one [`MemoryPeer`] per member, created on first use.
#[derive(Default)]
pub struct MemoryPeerDirectory {
    peers: Mutex<HashMap<MemberId, Arc<MemoryPeer>>>,
}

impl MemoryPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete peer for `member`, for test setup and assertions.
    pub fn peer_for(&self, member: MemberId) -> Arc<MemoryPeer> {
        Arc::clone(
            self.peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(member)
                .or_insert_with(|| Arc::new(MemoryPeer::new(member))),
        )
    }
}

impl PeerDirectory for MemoryPeerDirectory {
    fn peer(&self, member: &Member) -> Result<Arc<dyn MigrationPeer>, TransportError> {
        Ok(self.peer_for(member.id))
    }
}
