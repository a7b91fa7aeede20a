//! Event types for the devrec event system
//!
//! Provides the shared [`ReconEvent`] enum and an in-process [`EventBus`]
//! backed by a tokio broadcast channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Reconciliation events
///
/// Status and classification values are carried in their wire (snake_case)
/// form so subscribers do not depend on engine types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReconEvent {
    /// A new device was added to the registry
    DeviceRegistered {
        device_id: Uuid,
        manufacturer: String,
        timestamp: DateTime<Utc>,
    },

    /// A known device was seen again; metadata and last_seen refreshed
    DeviceRefreshed {
        device_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A known device changed address and the registry was updated
    DeviceMoved {
        device_id: Uuid,
        movement_id: Uuid,
        old_ip: Option<String>,
        new_ip: String,
        timestamp: DateTime<Utc>,
    },

    /// An observation was placed in the discovery queue for review
    QueueEntryCreated {
        entry_id: Uuid,
        manufacturer: String,
        classification: String,
        timestamp: DateTime<Utc>,
    },

    /// A queue entry changed status
    QueueEntryTransitioned {
        entry_id: Uuid,
        old_status: String,
        new_status: String,
        reviewed_by: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A movement record was acknowledged by a reviewer
    MovementAcknowledged {
        movement_id: Uuid,
        acknowledged_by: String,
        timestamp: DateTime<Utc>,
    },

    /// An observation was dropped before reaching the resolver
    ObservationRejected {
        manufacturer: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// In-process broadcast bus for [`ReconEvent`]s
///
/// Cloning is cheap; clones share the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ReconEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ReconEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ReconEvent,
    ) -> Result<usize, broadcast::error::SendError<ReconEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ReconEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let device_id = Uuid::new_v4();
        bus.emit(ReconEvent::DeviceRefreshed {
            device_id,
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            ReconEvent::DeviceRefreshed { device_id: got, .. } => assert_eq!(got, device_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_fails_but_lossy_does_not_panic() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);

        let event = ReconEvent::ObservationRejected {
            manufacturer: "shure".to_string(),
            reason: "no identity".to_string(),
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ReconEvent::MovementAcknowledged {
            movement_id: Uuid::nil(),
            acknowledged_by: "alice".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MovementAcknowledged");
        assert_eq!(json["acknowledged_by"], "alice");
    }
}
