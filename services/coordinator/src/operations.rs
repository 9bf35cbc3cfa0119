//! Operation tracking.
//!
//! Every call shape is recorded as an operation so that callers get an
//! `operation_id` back. Long-running calls (evacuate, restore, move) run on a
//! background task and are polled through the registry; they observe
//! cooperative cancellation through a [`CancelToken`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use drover_id::OperationId;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::error::{ClusterError, ClusterResult};

/// Sending half of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half of a cancellation signal. Checked at safe boundaries.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, token) = cancel_pair();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> ClusterResult<()> {
        if self.is_cancelled() {
            Err(ClusterError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Creates a linked handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Placement,
    JoinToken,
    Join,
    Evacuate,
    /// Evacuation started by the sweeper for a long-offline member.
    Heal,
    Restore,
    Move,
}

/// Operation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Error recorded on a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&ClusterError> for OperationError {
    fn from(e: &ClusterError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: e.is_transient(),
        }
    }
}

/// Snapshot of an operation.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Member name or resource id the operation acts on.
    pub target: String,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct Entry {
    operation: Operation,
    cancel: Option<CancelHandle>,
}

/// Owned terminal state of an operation, computed before the registry lock
/// is taken so the outcome itself never crosses an await.
struct Settled {
    status: OperationStatus,
    result: Option<serde_json::Value>,
    error: Option<OperationError>,
}

impl Settled {
    fn from_outcome<T: Serialize>(id: OperationId, outcome: &ClusterResult<T>) -> Self {
        match outcome {
            Ok(value) => {
                let result = serde_json::to_value(value)
                    .map_err(|e| {
                        warn!(operation_id = %id, error = %e, "Failed to serialize operation result");
                    })
                    .ok();
                Self {
                    status: OperationStatus::Succeeded,
                    result,
                    error: None,
                }
            }
            Err(e @ ClusterError::Cancelled) => Self {
                status: OperationStatus::Cancelled,
                result: None,
                error: Some(OperationError::from(e)),
            },
            Err(e) => Self {
                status: OperationStatus::Failed,
                result: None,
                error: Some(OperationError::from(e)),
            },
        }
    }
}

/// In-memory operation registry.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    entries: Arc<RwLock<HashMap<OperationId, Entry>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, kind: OperationKind, target: &str, cancel: Option<CancelHandle>) -> OperationId {
        let now = Utc::now();
        let id = OperationId::new();
        let operation = Operation {
            id,
            kind,
            target: target.to_string(),
            status: OperationStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.entries
            .write()
            .await
            .insert(id, Entry { operation, cancel });
        id
    }

    /// Records a synchronous call that already finished.
    pub async fn record<T: Serialize>(
        &self,
        kind: OperationKind,
        target: &str,
        outcome: &ClusterResult<T>,
    ) -> OperationId {
        let id = self.insert(kind, target, None).await;
        self.finish(id, Settled::from_outcome(id, outcome)).await;
        id
    }

    /// Starts `work` on a background task and returns its operation ID immediately.
    pub async fn spawn<T, F, Fut>(&self, kind: OperationKind, target: &str, work: F) -> OperationId
    where
        T: Serialize + Send + 'static,
        F: FnOnce(OperationId, CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ClusterResult<T>> + Send + 'static,
    {
        let (handle, token) = cancel_pair();
        let id = self.insert(kind, target, Some(handle)).await;
        info!(operation_id = %id, ?kind, %target, "Operation created");

        let registry = self.clone();
        tokio::spawn(async move {
            registry.set_status(id, OperationStatus::Running).await;
            let settled = Settled::from_outcome(id, &work(id, token).await);
            registry.finish(id, settled).await;
        });

        id
    }

    async fn set_status(&self, id: OperationId, status: OperationStatus) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.operation.status = status;
            entry.operation.updated_at = Utc::now();
        }
    }

    /// Stores a settled outcome and drops the cancel handle.
    async fn finish(&self, id: OperationId, settled: Settled) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };

        let op = &mut entry.operation;
        op.updated_at = Utc::now();
        op.status = settled.status;
        op.result = settled.result;
        op.error = settled.error;
        entry.cancel = None;
        info!(operation_id = %id, status = ?op.status, "Operation finished");
    }

    pub async fn get(&self, id: &OperationId) -> Option<Operation> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.operation.clone())
    }

    pub async fn list(&self) -> Vec<Operation> {
        let mut ops: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.operation.clone())
            .collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Requests cancellation. Returns false if the operation is unknown or already finished.
    pub async fn cancel(&self, id: &OperationId) -> bool {
        match self.entries.read().await.get(id) {
            Some(Entry {
                cancel: Some(handle),
                ..
            }) => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Waits until the operation reaches a terminal status.
    pub async fn wait(&self, id: &OperationId) -> Option<Operation> {
        loop {
            let op = self.get(id).await?;
            if op.status.is_terminal() {
                return Some(op);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
