use thiserror::Error;

/// Failures encoding or decoding event payloads.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The payload does not have the shape its event type promises.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
