//! Typed ID definitions for cluster resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.

use crate::define_id;

// =============================================================================
// Membership
// =============================================================================

define_id!(
    /// A cluster member (one host participating in the cluster).
    MemberId,
    "mem"
);
define_id!(
    /// A join token record. The secret itself never appears in this ID.
    TokenId,
    "tok"
);

// =============================================================================
// Workloads
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(VolumeId, "vol");

// =============================================================================
// Tracking
// =============================================================================

define_id!(
    /// An asynchronous operation returned to API callers.
    OperationId,
    "op"
);
define_id!(MigrationId, "mig");
define_id!(RequestId, "req");

// =============================================================================
// Resource ID
// =============================================================================

/// Identifies a placed resource, which is either an instance or a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceId {
    Instance(InstanceId),
    Volume(VolumeId),
}

impl ResourceId {
    /// Parses either an `inst_` or a `vol_` ID.
    pub fn parse(s: &str) -> Result<Self, crate::IdError> {
        match crate::split_prefixed(s, None)? {
            (InstanceId::PREFIX, _) => InstanceId::parse(s).map(Self::Instance),
            (VolumeId::PREFIX, _) => VolumeId::parse(s).map(Self::Volume),
            (other, _) => Err(crate::IdError::UnknownResourcePrefix(other.to_string())),
        }
    }

    pub fn is_instance(&self) -> bool {
        matches!(self, Self::Instance(_))
    }
}

impl From<InstanceId> for ResourceId {
    fn from(id: InstanceId) -> Self {
        Self::Instance(id)
    }
}

impl From<VolumeId> for ResourceId {
    fn from(id: VolumeId) -> Self {
        Self::Volume(id)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance(id) => std::fmt::Display::fmt(id, f),
            Self::Volume(id) => std::fmt::Display::fmt(id, f),
        }
    }
}

crate::impl_string_serde!(ResourceId);

// =============================================================================
// Events
// =============================================================================

/// Position of an event on the bus. Assigned by the bus, strictly increasing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_member_id_roundtrip() {
        let id = MemberId::new();
        let parsed: MemberId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("mem_"));
    }

    #[test]
    fn test_member_id_invalid_prefix() {
        let result: Result<MemberId, _> = "inst_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { expected: "mem", .. }
        ));
    }

    #[test]
    fn test_missing_separator_and_empty() {
        assert!(matches!(
            "mem01HV4Z2WQXKJNM8GPQY6VBKC3D".parse::<MemberId>(),
            Err(crate::IdError::MissingSeparator)
        ));
        assert!("".parse::<MemberId>().unwrap_err().is_empty());
    }

    #[test]
    fn test_invalid_ulid() {
        assert!(matches!(
            "op_not-a-ulid".parse::<OperationId>(),
            Err(crate::IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_resource_id_dispatches_on_prefix() {
        let inst = InstanceId::new();
        let vol = VolumeId::new();

        assert_eq!(
            ResourceId::parse(&inst.to_string()).unwrap(),
            ResourceId::Instance(inst)
        );
        assert_eq!(
            ResourceId::parse(&vol.to_string()).unwrap(),
            ResourceId::Volume(vol)
        );

        let err = ResourceId::parse("mem_01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_resource_id_json_is_plain_string() {
        let id = ResourceId::from(InstanceId::new());
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with("\"inst_"));
        let parsed: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let first = OperationId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = OperationId::new();
        assert!(first < second);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [
            MemberId::PREFIX,
            TokenId::PREFIX,
            InstanceId::PREFIX,
            VolumeId::PREFIX,
            OperationId::PREFIX,
            MigrationId::PREFIX,
            RequestId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(s in "\\PC*") {
            let _ = MemberId::parse(&s);
            let _ = ResourceId::parse(&s);
        }

        #[test]
        fn prop_ulid_roundtrip(raw in any::<u128>()) {
            let id = MigrationId::from_ulid(crate::Ulid::from(raw));
            prop_assert_eq!(MigrationId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
