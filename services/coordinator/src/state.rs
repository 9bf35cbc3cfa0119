//! Application state shared across request handlers.

use std::sync::Arc;

use crate::cluster::Cluster;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cluster: Cluster,
    local_member: String,
}

impl AppState {
    /// `local_member` is the member this coordinator runs on; it acts as
    /// requester when a call does not name one.
    pub fn new(cluster: Cluster, local_member: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                cluster,
                local_member: local_member.into(),
            }),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    pub fn local_member(&self) -> &str {
        &self.inner.local_member
    }
}
