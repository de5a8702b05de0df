//! Structured events emitted on every work item state transition.
//!
//! Consumers subscribe to the event stream to build dashboards, alerting,
//! or audit logs. Delivery is best-effort: a lagging subscriber loses the
//! oldest events and can detect the gap from `seq`.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{Priority, WorkId};

/// A structured event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkSubmitted {
        id: WorkId,
        handler: String,
        priority: Priority,
        source: String,
    },
    WorkLeased {
        id: WorkId,
        attempt: u32,
    },
    WorkRetried {
        id: WorkId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    WorkDeferred {
        id: WorkId,
        delay_ms: u64,
    },
    WorkSucceeded {
        id: WorkId,
        attempt: u32,
        duration_ms: u64,
    },
    WorkFailed {
        id: WorkId,
        attempts: u32,
        reason: String,
    },
    WorkExpired {
        id: WorkId,
    },
    LeaseReaped {
        id: WorkId,
    },
    ScheduleFired {
        schedule_id: String,
        id: WorkId,
        instant: DateTime<Utc>,
    },
    ScheduleMisfired {
        schedule_id: String,
        instant: DateTime<Utc>,
        reason: String,
    },
    /// Forward compatibility: an event type this build doesn't know.
    #[serde(other)]
    Unknown,
}

/// Fan-out of engine events with monotonic sequence numbers.
pub struct EventBus {
    seq: AtomicU64,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            seq: AtomicU64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, kind: EventKind) -> Event {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        let _ = self.tx.send(event.clone());
        event
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = WorkId::new();
        bus.emit(EventKind::WorkExpired { id });
        bus.emit(EventKind::LeaseReaped { id });

        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert!(b.seq > a.seq);
        assert_eq!(b.kind, EventKind::LeaseReaped { id });
    }

    #[test]
    fn unrecognized_event_type_decodes_as_unknown() {
        let raw = r#"{"type":"quantum_entangled","qubit_id":"q42"}"#;
        let kind: EventKind = serde_json::from_str(raw).unwrap();
        assert_eq!(kind, EventKind::Unknown);
    }
}
