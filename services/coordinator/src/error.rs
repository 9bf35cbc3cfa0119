//! Error taxonomy for cluster coordination.

use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::storage::StorageError;
use crate::store::StoreError;

/// Result type for coordination operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by membership, join, placement, evacuation and transfer.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("name already in use: {0}")]
    DuplicateName(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("member {0} still hosts resources")]
    MemberNotEvacuated(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("invalid join token: {0}")]
    InvalidToken(String),

    #[error("join timed out: {0}")]
    JoinTimeout(String),

    #[error("target member unavailable: {0}")]
    TargetUnavailable(String),

    #[error("no eligible members: {0}")]
    NoEligibleMembers(String),

    #[error("member unreachable: {0}")]
    MemberUnreachable(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("not a cluster member: {0}")]
    NotClusterMember(String),

    #[error("untrusted certificate: {0}")]
    UntrustedCertificate(String),

    #[error("member not found: {0}")]
    MemberNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("runtime action failed: {0}")]
    Runtime(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ClusterError {
    /// True for failures that may succeed if the caller retries later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::JoinTimeout(_) | Self::MemberUnreachable(_) | Self::TransferFailed(_) => true,
            Self::Store(e) => e.is_conflict(),
            _ => false,
        }
    }

    /// Returns true if no placement target could be found for a request.
    pub fn is_no_target(&self) -> bool {
        matches!(
            self,
            Self::NoEligibleMembers(_) | Self::TargetUnavailable(_) | Self::UnknownGroup(_)
        )
    }

    /// Stable machine-readable code, used in problem responses and operation records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateName(_) => "duplicate_name",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::MemberNotEvacuated(_) => "member_not_evacuated",
            Self::UnknownGroup(_) => "unknown_group",
            Self::InvalidToken(_) => "invalid_token",
            Self::JoinTimeout(_) => "join_timeout",
            Self::TargetUnavailable(_) => "target_unavailable",
            Self::NoEligibleMembers(_) => "no_eligible_members",
            Self::MemberUnreachable(_) => "member_unreachable",
            Self::TransferFailed(_) => "transfer_failed",
            Self::NotClusterMember(_) => "not_cluster_member",
            Self::UntrustedCertificate(_) => "untrusted_certificate",
            Self::MemberNotFound(_) => "member_not_found",
            Self::ResourceNotFound(_) => "resource_not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Cancelled => "cancelled",
            Self::Runtime(_) => "runtime_failed",
            Self::Storage(_) => "storage_error",
            Self::Store(e) if e.is_conflict() => "store_conflict",
            Self::Store(_) => "store_error",
        }
    }
}

impl From<RuntimeError> for ClusterError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Unreachable(member) => Self::MemberUnreachable(member),
            RuntimeError::Failed(reason) => Self::Runtime(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClusterError::JoinTimeout("x".into()).is_transient());
        assert!(ClusterError::MemberUnreachable("m1".into()).is_transient());
        assert!(ClusterError::TransferFailed("io".into()).is_transient());
        assert!(ClusterError::Store(StoreError::Conflict {
            expected: 1,
            actual: 2
        })
        .is_transient());

        assert!(!ClusterError::DuplicateName("m1".into()).is_transient());
        assert!(!ClusterError::Store(StoreError::Corrupt("bad".into())).is_transient());
    }

    #[test]
    fn test_runtime_error_mapping() {
        let unreachable: ClusterError = RuntimeError::Unreachable("m1".into()).into();
        assert!(matches!(unreachable, ClusterError::MemberUnreachable(ref m) if m == "m1"));

        let failed: ClusterError = RuntimeError::Failed("boom".into()).into();
        assert_eq!(failed.code(), "runtime_failed");
        assert!(!failed.is_transient());
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            ClusterError::UnknownGroup("gpu".into()).code(),
            "unknown_group"
        );
        assert_eq!(ClusterError::Cancelled.code(), "cancelled");
    }
}
