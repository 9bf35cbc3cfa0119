//! # drover-events
//!
//! Cluster lifecycle events and the status enums every drover service
//! shares.
//!
//! An event is published after the state change it describes has been
//! committed, and is never edited afterwards. Each one is wrapped in an
//! [`EventEnvelope`] naming the aggregate it belongs to (member, group,
//! token, resource or migration), who caused it and, for work done on
//! behalf of an API call, the operation ID as `correlation_id`.
//!
//! Token events identify tokens by ID and server name only. The secret
//! never leaves the coordinator's store.
//!
//! Event type names are dotted (`member.joined`, `evacuation.completed`,
//! ...) and listed in [`event_types`].

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
