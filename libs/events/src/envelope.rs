//! The envelope every published event travels in.

use chrono::{DateTime, Utc};
use drover_id::{EventId, OperationId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::EventError;

/// Current envelope schema version.
pub const EVENT_VERSION: i32 = 1;

/// Who caused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Operator,
    /// A member agent (heartbeats, join).
    Member,
    /// The coordinator itself (sweeper, evacuation).
    #[default]
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Member => "member",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of entity an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Member,
    Group,
    Token,
    Resource,
    Migration,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Group => "group",
            Self::Token => "token",
            Self::Resource => "resource",
            Self::Migration => "migration",
        }
    }
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed state transition together with its routing and audit data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    pub event_id: EventId,
    pub occurred_at: DateTime<Utc>,
    pub aggregate_type: AggregateType,
    /// Member, token, resource or migration ID; group name for groups.
    pub aggregate_id: String,
    /// Dotted name such as `member.joined`, see [`crate::event_types`].
    pub event_type: String,
    pub event_version: i32,
    pub actor_type: ActorType,
    pub actor_id: String,
    /// Operation that produced the event, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<OperationId>,
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// A system event stamped with the current time.
    pub fn new(
        event_id: EventId,
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: P,
    ) -> Self {
        Self {
            event_id,
            occurred_at: Utc::now(),
            aggregate_type,
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            event_version: EVENT_VERSION,
            actor_type: ActorType::System,
            actor_id: "coordinator".to_string(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id.into();
        self
    }

    pub fn with_correlation(mut self, operation: Option<OperationId>) -> Self {
        self.correlation_id = operation;
        self
    }

    /// Re-encodes the payload as JSON, keeping the envelope.
    pub fn into_json(self) -> Result<EventEnvelope<serde_json::Value>, EventError>
    where
        P: Serialize,
    {
        let payload = serde_json::to_value(&self.payload)?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            event_version: self.event_version,
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            correlation_id: self.correlation_id,
            payload,
        })
    }
}

impl EventEnvelope<serde_json::Value> {
    /// Decodes the JSON payload into the typed payload for this event type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EventError::InvalidPayload(format!("{}: {e}", self.event_type)))
    }
}
