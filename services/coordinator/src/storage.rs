//! Storage backend interface.
//!
//! Volume drivers are external to the coordinator; it only asks a backend to
//! create, delete and copy volumes. Volumes on remote pools have no host.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use drover_id::{MemberId, VolumeId};
use thiserror::Error;
use tracing::info;

/// Errors from storage backend calls.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    #[error("volume {0} already exists")]
    AlreadyExists(String),

    #[error("storage backend failed: {0}")]
    Failed(String),
}

/// Storage subsystem interface.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Creates a volume in `pool`, on `host` for member-local pools.
    async fn create_volume(
        &self,
        pool: &str,
        volume: &VolumeId,
        host: Option<&MemberId>,
        size_bytes: u64,
    ) -> Result<(), StorageError>;

    async fn delete_volume(
        &self,
        pool: &str,
        volume: &VolumeId,
        host: Option<&MemberId>,
    ) -> Result<(), StorageError>;

    /// Copies a member-local volume from `source` to `target`, keeping the source copy.
    async fn clone_volume(
        &self,
        pool: &str,
        volume: &VolumeId,
        source: &MemberId,
        target: &MemberId,
    ) -> Result<(), StorageError>;
}

type VolumeKey = (String, VolumeId, Option<MemberId>);

/// In-memory storage backend for tests and dev mode.
#[derive(Default)]
pub struct MemoryStorage {
    volumes: Mutex<BTreeMap<VolumeKey, u64>>,
    failing_pools: Mutex<HashSet<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call against `pool` fail.
    pub fn fail_pool(&self, pool: &str) {
        self.failing_pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pool.to_string());
    }

    /// Returns true if the volume exists at the given location.
    pub fn contains(&self, pool: &str, volume: &VolumeId, host: Option<&MemberId>) -> bool {
        self.volumes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(pool.to_string(), *volume, host.copied()))
    }

    pub fn volume_count(&self) -> usize {
        self.volumes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn check_pool(&self, pool: &str) -> Result<(), StorageError> {
        if self
            .failing_pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(pool)
        {
            return Err(StorageError::Failed(format!("pool {pool} is failing")));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn create_volume(
        &self,
        pool: &str,
        volume: &VolumeId,
        host: Option<&MemberId>,
        size_bytes: u64,
    ) -> Result<(), StorageError> {
        self.check_pool(pool)?;
        let mut volumes = self.volumes.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (pool.to_string(), *volume, host.copied());
        if volumes.contains_key(&key) {
            return Err(StorageError::AlreadyExists(volume.to_string()));
        }
        volumes.insert(key, size_bytes);
        info!(%pool, %volume, size_bytes, "[MOCK] Created volume");
        Ok(())
    }

    async fn delete_volume(
        &self,
        pool: &str,
        volume: &VolumeId,
        host: Option<&MemberId>,
    ) -> Result<(), StorageError> {
        self.check_pool(pool)?;
        let removed = self
            .volumes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(pool.to_string(), *volume, host.copied()));
        match removed {
            Some(_) => {
                info!(%pool, %volume, "[MOCK] Deleted volume");
                Ok(())
            }
            None => Err(StorageError::VolumeNotFound(volume.to_string())),
        }
    }

    async fn clone_volume(
        &self,
        pool: &str,
        volume: &VolumeId,
        source: &MemberId,
        target: &MemberId,
    ) -> Result<(), StorageError> {
        self.check_pool(pool)?;
        let mut volumes = self.volumes.lock().unwrap_or_else(PoisonError::into_inner);
        let size = volumes
            .get(&(pool.to_string(), *volume, Some(*source)))
            .copied()
            .ok_or_else(|| StorageError::VolumeNotFound(volume.to_string()))?;
        volumes.insert((pool.to_string(), *volume, Some(*target)), size);
        info!(%pool, %volume, %source, %target, "[MOCK] Cloned volume");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clone_then_delete_source() {
        let storage = MemoryStorage::new();
        let volume = VolumeId::new();
        let (m1, m2) = (MemberId::new(), MemberId::new());

        storage
            .create_volume("local", &volume, Some(&m1), 1 << 20)
            .await
            .unwrap();
        storage
            .clone_volume("local", &volume, &m1, &m2)
            .await
            .unwrap();
        storage
            .delete_volume("local", &volume, Some(&m1))
            .await
            .unwrap();

        assert!(storage.contains("local", &volume, Some(&m2)));
        assert!(!storage.contains("local", &volume, Some(&m1)));
    }

    #[tokio::test]
    async fn test_failing_pool() {
        let storage = MemoryStorage::new();
        storage.fail_pool("ceph");
        let err = storage
            .create_volume("ceph", &VolumeId::new(), None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Failed(_)));
        assert_eq!(storage.volume_count(), 0);
    }
}
