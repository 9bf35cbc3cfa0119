//! Registry of in-flight migration sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use drover_events::TransferMode;
use drover_id::{MemberId, MigrationId, OperationId, ResourceId};
use serde::Serialize;

use crate::operations::{cancel_pair, CancelHandle, CancelToken};

/// Progress phase of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Connecting,
    Disk,
    PreCopy,
    FinalDump,
    Handoff,
}

/// A running migration, as exposed for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationSession {
    pub id: MigrationId,
    pub resource_id: ResourceId,
    pub source: MemberId,
    pub target: MemberId,
    pub mode: TransferMode,
    pub live: bool,
    pub phase: MigrationPhase,
    pub bytes_transferred: u64,
    pub precopy_iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    session: MigrationSession,
    cancel: CancelHandle,
}

/// Sessions registered while they run, so they can be listed and cancelled.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    sessions: Arc<Mutex<HashMap<MigrationId, Entry>>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<MigrationId, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session and returns the token its transfer must observe.
    pub fn register(&self, session: MigrationSession) -> CancelToken {
        let (cancel, token) = cancel_pair();
        self.sessions()
            .insert(session.id, Entry { session, cancel });
        token
    }

    pub fn update<F: FnOnce(&mut MigrationSession)>(&self, id: &MigrationId, f: F) {
        if let Some(entry) = self.sessions().get_mut(id) {
            f(&mut entry.session);
        }
    }

    pub fn finish(&self, id: &MigrationId) -> Option<MigrationSession> {
        self.sessions().remove(id).map(|e| e.session)
    }

    pub fn get(&self, id: &MigrationId) -> Option<MigrationSession> {
        self.sessions().get(id).map(|e| e.session.clone())
    }

    pub fn list(&self) -> Vec<MigrationSession> {
        let mut sessions: Vec<_> = self.sessions().values().map(|e| e.session.clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Requests cancellation. Returns false if no such session is running.
    pub fn cancel(&self, id: &MigrationId) -> bool {
        match self.sessions().get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}
