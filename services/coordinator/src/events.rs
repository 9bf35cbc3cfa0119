//! In-process event bus.
//!
//! Components publish an [`EventEnvelope`] after each committed state
//! transition. Subscribers (tests, future streaming endpoints) receive them
//! through a tokio broadcast channel; publishing never blocks and never fails
//! the operation that triggered it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use drover_events::{ActorType, AggregateType, EventEnvelope};
use drover_id::{EventId, OperationId};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// Event published on the bus.
pub type ClusterEvent = EventEnvelope<serde_json::Value>;

/// Cloneable handle to the event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Publishes a system-originated event.
    pub fn publish<P: Serialize>(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        event_type: &str,
        payload: &P,
        correlation_id: Option<OperationId>,
    ) {
        self.publish_as(
            ActorType::System,
            "coordinator",
            aggregate_type,
            aggregate_id,
            event_type,
            payload,
            correlation_id,
        );
    }

    /// Publishes an event attributed to a specific actor.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_as<P: Serialize>(
        &self,
        actor_type: ActorType,
        actor_id: &str,
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        event_type: &str,
        payload: &P,
        correlation_id: Option<OperationId>,
    ) {
        let event_id = EventId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event = EventEnvelope::new(event_id, aggregate_type, aggregate_id, event_type, payload)
            .with_actor(actor_type, actor_id)
            .with_correlation(correlation_id)
            .into_json();

        match event {
            Ok(event) => {
                if self.tx.send(event).is_err() {
                    debug!(event_type, "No event subscribers");
                }
            }
            Err(e) => warn!(error = %e, event_type, "Failed to serialize event payload"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_events::{event_types, GroupCreatedPayload};

    #[tokio::test]
    async fn test_publish_assigns_increasing_ids() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for name in ["gpu", "arm"] {
            bus.publish(
                AggregateType::Group,
                name,
                event_types::GROUP_CREATED,
                &GroupCreatedPayload {
                    name: name.to_string(),
                },
                None,
            );
        }

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.event_id < second.event_id);
        assert_eq!(second.aggregate_id, "arm");
        let payload: GroupCreatedPayload = second.decode().unwrap();
        assert_eq!(payload.name, "arm");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(
            AggregateType::Group,
            "gpu",
            event_types::GROUP_DELETED,
            &serde_json::json!({"name": "gpu", "members": []}),
            None,
        );
    }
}
