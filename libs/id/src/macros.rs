//! Macros shared by the ID types.

/// Splits `{prefix}_{rest}` and checks the prefix when `expected` is given.
#[doc(hidden)]
pub fn split_prefixed<'a>(
    s: &'a str,
    expected: Option<&'static str>,
) -> Result<(&'a str, &'a str), crate::IdError> {
    if s.is_empty() {
        return Err(crate::IdError::Empty);
    }
    let (prefix, rest) = s.split_once('_').ok_or(crate::IdError::MissingSeparator)?;
    match expected {
        Some(expected) if expected != prefix => Err(crate::IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        }),
        _ => Ok((prefix, rest)),
    }
}

/// Serializes a type through its `Display` form and deserializes through
/// its `parse` constructor.
#[doc(hidden)]
#[macro_export]
macro_rules! impl_string_serde {
    ($name:ident) => {
        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Defines a ULID-backed ID rendered as `{prefix}_{ulid}`.
///
/// ```ignore
/// define_id!(MemberId, "mem");
///
/// let id: MemberId = "mem_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// A fresh ID. IDs created later sort after earlier ones.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            /// Strict parse; the prefix must be exactly [`Self::PREFIX`].
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let (_, ulid) = $crate::split_prefixed(s, Some(Self::PREFIX))?;
                $crate::Ulid::from_string(ulid)
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUlid(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        $crate::impl_string_serde!($name);
    };
}
