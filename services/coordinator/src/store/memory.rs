//! In-memory cluster store.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ClusterSnapshot, ClusterStore, Mutation, StoreError};

/// Cluster store kept entirely in memory.
pub struct MemoryStore {
    state: RwLock<ClusterSnapshot>,
}

impl MemoryStore {
    /// Creates an empty store holding only the default group.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ClusterSnapshot::seeded()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn snapshot(&self) -> Result<ClusterSnapshot, StoreError> {
        Ok(self.state.read().await.clone())
    }

    async fn commit(&self, base_revision: u64, mutations: Vec<Mutation>) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        if state.revision != base_revision {
            return Err(StoreError::Conflict {
                expected: base_revision,
                actual: state.revision,
            });
        }

        for mutation in mutations {
            state.apply(mutation);
        }
        state.revision += 1;
        Ok(state.revision)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
