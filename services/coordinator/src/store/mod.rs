//! Cluster state store.
//!
//! The store is the single source of truth for members, groups, projects,
//! storage pools, join tokens and placed resources. Reads are consistent
//! snapshots; writes are batches of [`Mutation`]s committed against the
//! revision they were computed from.
//!
//! Two backends are provided:
//! - [`MemoryStore`] for tests and single-process dev mode
//! - [`SqliteStore`] for durable state (WAL mode, one table per record kind)

mod memory;
mod records;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ClusterResult;

pub use memory::MemoryStore;
pub use records::*;
pub use sqlite::SqliteStore;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("revision conflict: expected {expected}, store is at {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Backend interface for the cluster state.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Returns a consistent copy of the whole state.
    async fn snapshot(&self) -> Result<ClusterSnapshot, StoreError>;

    /// Applies `mutations` atomically if the store is still at `base_revision`.
    ///
    /// Returns the new revision.
    async fn commit(&self, base_revision: u64, mutations: Vec<Mutation>) -> Result<u64, StoreError>;

    /// Checks that the backend can serve requests.
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Shared handle that serializes writers within one process.
///
/// Every write reads a snapshot, computes its mutations and commits them
/// against that snapshot's revision while holding the write lock. A commit
/// from another process sharing the backend surfaces as a conflict.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn ClusterStore>,
    write_lock: Arc<Mutex<()>>,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Reads a snapshot without taking the write lock.
    pub async fn read(&self) -> Result<ClusterSnapshot, StoreError> {
        self.store.snapshot().await
    }

    /// Runs `decide` against a fresh snapshot and commits the mutations it returns.
    ///
    /// Nothing is committed when `decide` fails or returns no mutations.
    pub async fn transact<T, F>(&self, decide: F) -> ClusterResult<T>
    where
        F: FnOnce(&ClusterSnapshot) -> ClusterResult<(Vec<Mutation>, T)>,
    {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.store.snapshot().await?;
        let (mutations, value) = decide(&snapshot)?;

        if mutations.is_empty() {
            return Ok(value);
        }

        let count = mutations.len();
        let revision = self.store.commit(snapshot.revision, mutations).await?;
        debug!(revision, mutations = count, "Committed cluster state");
        Ok(value)
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;

    #[tokio::test]
    async fn test_transact_skips_empty_batches() {
        let handle = StoreHandle::new(Arc::new(MemoryStore::new()));
        let before = handle.read().await.unwrap().revision;

        let value = handle.transact(|_| Ok((Vec::new(), 7))).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(handle.read().await.unwrap().revision, before);
    }

    #[tokio::test]
    async fn test_transact_does_not_commit_on_error() {
        let handle = StoreHandle::new(Arc::new(MemoryStore::new()));
        let result: ClusterResult<()> = handle
            .transact(|_| Err(ClusterError::InvalidRequest("nope".into())))
            .await;
        assert!(result.is_err());
        assert_eq!(handle.read().await.unwrap().revision, 0);
    }

    #[tokio::test]
    async fn test_transact_commits_and_bumps_revision() {
        let handle = StoreHandle::new(Arc::new(MemoryStore::new()));
        handle
            .transact(|_| {
                Ok((
                    vec![Mutation::PutPool(StoragePool {
                        name: "remote".into(),
                        remote: true,
                    })],
                    (),
                ))
            })
            .await
            .unwrap();

        let snapshot = handle.read().await.unwrap();
        assert_eq!(snapshot.revision, 1);
        assert!(snapshot.pools["remote"].remote);
    }
}
