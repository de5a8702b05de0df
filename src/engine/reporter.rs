//! Status reporting: every state change the engine makes is announced here
//! as a structured event, a metric and a log line.
//!
//! The store already holds the new state by the time a report is made; the
//! reporter never writes to the store itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::event::{EventBus, EventKind};
use crate::model::{State, WorkId, WorkItem};
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct StatusReporter {
    events: Arc<EventBus>,
}

fn transition(from: State, to: State) {
    metrics::work_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

impl StatusReporter {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn submitted(&self, item: &WorkItem) {
        metrics::work_submitted().add(
            1,
            &[
                KeyValue::new("handler", item.handler_name.clone()),
                KeyValue::new("source", item.provenance.source.clone()),
            ],
        );
        self.events.emit(EventKind::WorkSubmitted {
            id: item.id,
            handler: item.handler_name.clone(),
            priority: item.priority,
            source: item.provenance.source.clone(),
        });
    }

    pub fn leased(&self, item: &WorkItem) {
        transition(State::Pending, State::Leased);
        self.events.emit(EventKind::WorkLeased {
            id: item.id,
            attempt: item.attempt_count + 1,
        });
    }

    pub fn succeeded(&self, item: &WorkItem, duration: Duration) {
        let duration_ms = duration.as_millis() as u64;
        transition(State::Leased, State::Succeeded);
        metrics::operation_duration_ms().record(
            duration_ms as f64,
            &[KeyValue::new("operation", "work.execute")],
        );
        info!(id = %item.id, handler = %item.handler_name, attempt = item.attempt_count, duration_ms, "work succeeded");
        self.events.emit(EventKind::WorkSucceeded {
            id: item.id,
            attempt: item.attempt_count,
            duration_ms,
        });
    }

    pub fn retried(&self, item: &WorkItem, delay: Duration, error: &str) {
        let delay_ms = delay.as_millis() as u64;
        transition(State::Leased, State::Pending);
        metrics::work_retries().add(1, &[KeyValue::new("handler", item.handler_name.clone())]);
        warn!(
            id = %item.id,
            handler = %item.handler_name,
            attempt = item.attempt_count,
            max_attempts = item.max_attempts,
            delay_ms,
            %error,
            "attempt failed, retrying"
        );
        self.events.emit(EventKind::WorkRetried {
            id: item.id,
            attempt: item.attempt_count,
            delay_ms,
            error: error.to_string(),
        });
    }

    pub fn deferred(&self, id: WorkId, delay: Duration) {
        transition(State::Leased, State::Pending);
        self.events.emit(EventKind::WorkDeferred {
            id,
            delay_ms: delay.as_millis() as u64,
        });
    }

    pub fn failed(&self, item: &WorkItem, reason: &str) {
        transition(State::Leased, State::Failed);
        warn!(
            id = %item.id,
            handler = %item.handler_name,
            attempts = item.attempt_count,
            %reason,
            "work failed"
        );
        self.events.emit(EventKind::WorkFailed {
            id: item.id,
            attempts: item.attempt_count,
            reason: reason.to_string(),
        });
    }

    pub fn unroutable(&self, item: &WorkItem) {
        metrics::work_unroutable().add(1, &[KeyValue::new("handler", item.handler_name.clone())]);
        self.failed(item, &format!("no handler registered for {:?}", item.handler_name));
    }

    pub fn expired(&self, id: WorkId) {
        transition(State::Pending, State::Expired);
        info!(%id, "work expired before it could run");
        self.events.emit(EventKind::WorkExpired { id });
    }

    pub fn reaped(&self, id: WorkId) {
        transition(State::Leased, State::Pending);
        metrics::leases_reaped().add(1, &[]);
        info!(%id, "lease expired, returned to pending");
        self.events.emit(EventKind::LeaseReaped { id });
    }

    pub fn schedule_fired(&self, schedule_id: &str, id: WorkId, instant: DateTime<Utc>) {
        metrics::schedule_fired().add(1, &[KeyValue::new("schedule", schedule_id.to_string())]);
        info!(schedule = schedule_id, %id, %instant, "schedule fired");
        self.events.emit(EventKind::ScheduleFired {
            schedule_id: schedule_id.to_string(),
            id,
            instant,
        });
    }

    pub fn schedule_misfired(
        &self,
        schedule_id: &str,
        instant: DateTime<Utc>,
        reason: &'static str,
        detail: &str,
    ) {
        metrics::schedule_misfires().add(
            1,
            &[
                KeyValue::new("schedule", schedule_id.to_string()),
                KeyValue::new("reason", reason),
            ],
        );
        warn!(schedule = schedule_id, %instant, reason, detail, "schedule tick missed");
        self.events.emit(EventKind::ScheduleMisfired {
            schedule_id: schedule_id.to_string(),
            instant,
            reason: format!("{reason}: {detail}"),
        });
    }
}
