//! Live-view event bus.
//!
//! Each session and each technician gets a topic; live-view consumers
//! subscribe to a topic and receive session events as they happen. Broadcast
//! semantics apply: a slow subscriber loses the oldest events, publishing
//! never blocks the engine.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::models::{
    FaultCode, SensorReading, SessionErrorReason, SessionOutcome, TransportKind,
};

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Topic name for one session's live view
pub fn session_topic(session_id: Uuid) -> String {
    format!("session:{session_id}")
}

/// Topic name for everything involving one technician
pub fn technician_topic(technician_id: &str) -> String {
    format!("technician:{technician_id}")
}

/// Events published over the live-view channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_id: Uuid,
        vehicle_vin: String,
        device_serial: String,
    },
    Reading {
        session_id: Uuid,
        reading: SensorReading,
    },
    FaultDetected {
        session_id: Uuid,
        fault: FaultCode,
    },
    DiagnosisAdded {
        session_id: Uuid,
        diagnosis_id: Uuid,
    },
    ConnectionRecovering {
        session_id: Uuid,
        device_serial: String,
    },
    ConnectionRecovered {
        session_id: Uuid,
        device_serial: String,
        transport: TransportKind,
    },
    SessionCompleted {
        session_id: Uuid,
        outcome: SessionOutcome,
    },
    SessionCancelled {
        session_id: Uuid,
    },
    SessionFailed {
        session_id: Uuid,
        reason: SessionErrorReason,
    },
}

/// Per-topic broadcast fan-out for live-view consumers
pub struct EventBus {
    topics: RwLock<HashMap<String, broadcast::Sender<SessionEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to a topic, creating it if needed
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<SessionEvent> {
        let mut topics = self.topics.write();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to a topic. Returns the number of live subscribers.
    ///
    /// Topics nobody listens to are pruned on publish; events published
    /// before the first subscriber are dropped.
    pub fn publish(&self, topic: &str, event: SessionEvent) -> usize {
        let delivered = {
            let topics = self.topics.read();
            match topics.get(topic) {
                Some(sender) => sender.send(event).unwrap_or(0),
                None => 0,
            }
        };
        if delivered == 0 {
            let mut topics = self.topics.write();
            if topics.get(topic).is_some_and(|s| s.receiver_count() == 0) {
                topics.remove(topic);
                trace!(%topic, "Pruned idle event topic");
            }
        }
        delivered
    }

    /// Number of topics with at least one subscriber
    pub fn active_topics(&self) -> usize {
        self.topics
            .read()
            .values()
            .filter(|s| s.receiver_count() > 0)
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancelled(session_id: Uuid) -> SessionEvent {
        SessionEvent::SessionCancelled { session_id }
    }

    #[tokio::test]
    async fn test_publish_reaches_topic_subscribers() {
        let bus = EventBus::default();
        let id = Uuid::new_v4();
        let mut rx = bus.subscribe(&session_topic(id));

        assert_eq!(bus.publish(&session_topic(id), cancelled(id)), 1);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::SessionCancelled { session_id } if session_id == id));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::default();
        let id = Uuid::new_v4();
        assert_eq!(bus.publish(&session_topic(id), cancelled(id)), 0);
        assert_eq!(bus.active_topics(), 0);
    }

    #[tokio::test]
    async fn test_dead_topic_pruned() {
        let bus = EventBus::default();
        let id = Uuid::new_v4();
        let rx = bus.subscribe(&session_topic(id));
        drop(rx);
        bus.publish(&session_topic(id), cancelled(id));
        assert_eq!(bus.active_topics(), 0);
    }
}
