use thiserror::Error;

/// Why a string is not a valid ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty ID")]
    Empty,

    #[error("expected a '{expected}_' ID, got prefix '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `_` between prefix and ULID.
    #[error("ID has no prefix separator")]
    MissingSeparator,

    #[error("malformed ULID: {0}")]
    InvalidUlid(String),

    /// Neither an instance nor a volume prefix.
    #[error("'{0}' is not a resource prefix")]
    UnknownResourcePrefix(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Wrong or unknown prefix, as opposed to a malformed string.
    pub fn is_prefix_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPrefix { .. } | Self::UnknownResourcePrefix(_)
        )
    }
}
