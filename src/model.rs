//! Core data model.
//!
//! A work item is one unit of background work: a handler name, an opaque
//! versioned payload, a priority, and a lease/retry lifecycle. A schedule
//! entry emits work items on a recurring cadence.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier. Immutable.
    pub id: WorkId,

    /// Which registered handler processes this item.
    pub handler_name: String,

    /// Arguments for the handler. The engine never looks inside.
    pub payload: Payload,

    /// Higher priority is dequeued first within the same readiness window.
    pub priority: Priority,

    /// Current lifecycle state.
    pub state: State,

    /// Who produced this item.
    pub provenance: Provenance,

    /// Attempts reported so far (success, failure or timeout).
    pub attempt_count: u32,

    /// Ceiling after which a failure is terminal.
    pub max_attempts: u32,

    /// Earliest instant the item may be dequeued.
    pub not_before: DateTime<Utc>,

    /// Set while `Leased`; after this instant the lease is abandoned.
    pub lease_expiry: Option<DateTime<Utc>>,

    /// Identifies the current lease holder. Reports must present it.
    pub lease_token: Option<LeaseToken>,

    /// Pending items past this deadline expire instead of running.
    pub expires_at: Option<DateTime<Utc>>,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,

    /// Delay applied before the current retry, in milliseconds.
    pub last_backoff_ms: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Build a fresh `Pending` item from a submission.
    pub fn from_new(new: NewWorkItem, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkId::new(),
            handler_name: new.handler_name,
            payload: new.payload,
            priority: new.priority,
            state: State::Pending,
            provenance: new.provenance,
            attempt_count: 0,
            max_attempts: new.max_attempts.unwrap_or(default_max_attempts).max(1),
            not_before: new.not_before.unwrap_or(now),
            lease_expiry: None,
            lease_token: None,
            expires_at: new.expires_at,
            last_error: None,
            last_backoff_ms: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// The status view surfaced to API consumers.
    pub fn status(&self) -> WorkStatus {
        WorkStatus {
            id: self.id,
            state: self.state,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            last_error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }

    /// True when a `Pending` item is eligible for dequeue at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == State::Pending
            && self.not_before <= now
            && self.expires_at.is_none_or(|deadline| deadline > now)
    }

    /// Move to `to`, refusing edges outside the lifecycle.
    pub fn transition(&mut self, to: State) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for WorkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(WorkId)
            .map_err(|e| Error::Other(format!("invalid work id {s:?}: {e}")))
    }
}

/// Token minted for each lease. Only the holder may report on the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A leased work item handed to a worker slot.
#[derive(Debug, Clone)]
pub struct Lease {
    pub item: WorkItem,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn id(&self) -> WorkId {
        self.item.id
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting in the queue (possibly delayed by `not_before`).
    Pending,
    /// Held by exactly one worker until `lease_expiry`.
    Leased,
    /// Done successfully. Terminal.
    Succeeded,
    /// Exhausted attempts, permanent error or unknown handler. Terminal.
    Failed,
    /// Deadline passed before it could run. Terminal.
    Expired,
}

impl State {
    pub const ALL: [State; 5] = [
        State::Pending,
        State::Leased,
        State::Succeeded,
        State::Failed,
        State::Expired,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, Leased)
                | (Pending, Expired)
                | (Leased, Pending)     // retry, lease expiry, deferral
                | (Leased, Succeeded)
                | (Leased, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed | State::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Leased => "leased",
            State::Succeeded => "succeeded",
            State::Failed => "failed",
            State::Expired => "expired",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(State::Pending),
            "leased" => Ok(State::Leased),
            "succeeded" => Ok(State::Succeeded),
            "failed" => Ok(State::Failed),
            "expired" => Ok(State::Expired),
            _ => Err(Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Ordered priority. Higher is dequeued first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Lowest = 1,
    Low = 2,
    #[default]
    Medium = 3,
    High = 4,
    Highest = 5,
}

impl Priority {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(n: i32) -> Result<Self> {
        match n {
            1 => Ok(Priority::Lowest),
            2 => Ok(Priority::Low),
            3 => Ok(Priority::Medium),
            4 => Ok(Priority::High),
            5 => Ok(Priority::Highest),
            _ => Err(Error::Other(format!("priority out of range: {n}"))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Lowest => "lowest",
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Highest => "highest",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lowest" => Ok(Priority::Lowest),
            "low" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "highest" => Ok(Priority::Highest),
            other => other
                .parse::<i32>()
                .map_err(|_| Error::Other(format!("unknown priority: {s}")))
                .and_then(Priority::from_i32),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Opaque handler arguments, tagged with a schema version owned by the
/// handler. Only the handler decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub version: u32,
    pub data: serde_json::Value,
}

impl Payload {
    pub fn new(data: serde_json::Value) -> Self {
        Self { version: 1, data }
    }

    pub fn versioned(version: u32, data: serde_json::Value) -> Self {
        Self { version, data }
    }

    /// Serialize a typed value as the payload body.
    pub fn encode<T: Serialize>(version: u32, value: &T) -> Result<Self> {
        let data = serde_json::to_value(value).map_err(|e| Error::Payload(e.to_string()))?;
        Ok(Self { version, data })
    }

    /// Decode the body, rejecting a schema version the caller doesn't speak.
    pub fn decode<T: DeserializeOwned>(&self, expected_version: u32) -> Result<T> {
        if self.version != expected_version {
            return Err(Error::Payload(format!(
                "payload version {} (expected {expected_version})",
                self.version
            )));
        }
        serde_json::from_value(self.data.clone()).map_err(|e| Error::Payload(e.to_string()))
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Where a work item came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// High-level source (e.g. "api", "schedule:nightly", "resubmit:<id>").
    pub source: String,

    /// More specific trigger (e.g. the schedule firing instant).
    pub trigger: Option<String>,
}

impl Default for Provenance {
    fn default() -> Self {
        Self {
            source: "api".to_string(),
            trigger: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Status views
// ---------------------------------------------------------------------------

/// Progress of one work item, as surfaced to end users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkStatus {
    pub id: WorkId,
    pub state: State,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Global counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub expired: u64,
    pub total: u64,
}

impl QueueStats {
    pub fn count(&self, state: State) -> u64 {
        match state {
            State::Pending => self.pending,
            State::Leased => self.leased,
            State::Succeeded => self.succeeded,
            State::Failed => self.failed,
            State::Expired => self.expired,
        }
    }

    pub fn add(&mut self, state: State, n: u64) {
        match state {
            State::Pending => self.pending += n,
            State::Leased => self.leased += n,
            State::Succeeded => self.succeeded += n,
            State::Failed => self.failed += n,
            State::Expired => self.expired += n,
        }
        self.total += n;
    }
}

/// Items touched by one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale leases returned to `Pending`.
    pub released: Vec<WorkId>,
    /// Overdue pending items moved to `Expired`.
    pub expired: Vec<WorkId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.expired.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// How often a schedule entry fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Interval { secs: u64 },
    Cron { expression: String },
}

impl ScheduleSpec {
    pub fn every(secs: u64) -> Self {
        ScheduleSpec::Interval { secs }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        ScheduleSpec::Cron {
            expression: expression.into(),
        }
    }

    /// Reject intervals of zero and unparseable cron expressions.
    pub fn validate(&self) -> Result<()> {
        match self {
            ScheduleSpec::Interval { secs } => interval_step(*secs).map(|_| ()),
            ScheduleSpec::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    /// The first firing instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            ScheduleSpec::Interval { secs } => after
                .checked_add_signed(interval_step(*secs)?)
                .ok_or_else(|| Error::InvalidSchedule(format!("every {secs}s overflows the calendar"))),
            ScheduleSpec::Cron { expression } => parse_cron(expression)?
                .after(&after)
                .next()
                .ok_or_else(|| {
                    Error::InvalidSchedule(format!("cron {expression:?} never fires again"))
                }),
        }
    }
}

/// Longest accepted interval: ten years.
pub const MAX_INTERVAL_SECS: u64 = 10 * 366 * 24 * 60 * 60;

/// The interval as a signed step, bounded to `1..=MAX_INTERVAL_SECS`.
pub(crate) fn interval_step(secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(Error::InvalidSchedule("interval must be positive".to_string()));
    }
    if secs > MAX_INTERVAL_SECS {
        return Err(Error::InvalidSchedule(format!(
            "interval {secs}s exceeds the {MAX_INTERVAL_SECS}s maximum"
        )));
    }
    // Bounded above, so the cast is lossless.
    Ok(Duration::seconds(secs as i64))
}

impl std::fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleSpec::Interval { secs } => write!(f, "every {secs}s"),
            ScheduleSpec::Cron { expression } => write!(f, "cron {expression}"),
        }
    }
}

/// Standard 5-field cron gets a leading seconds field; the `cron` crate
/// wants 6 or 7 fields.
fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let normalized = match expression.split_whitespace().count() {
        5 => format!("0 {expression}"),
        _ => expression.to_string(),
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::InvalidSchedule(format!("bad cron {expression:?}: {e}")))
}

/// A recurring job definition plus its durable firing cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub handler_name: String,
    pub spec: ScheduleSpec,
    pub payload_template: Payload,
    pub priority: Priority,
    pub max_attempts: Option<u32>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: DateTime<Utc>,
}

impl ScheduleEntry {
    /// New entry whose first firing is the first instant after `now`.
    pub fn new(
        id: impl Into<String>,
        handler_name: impl Into<String>,
        spec: ScheduleSpec,
        payload_template: Payload,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        spec.validate()?;
        let next_fire_at = spec.next_after(now)?;
        Ok(Self {
            id: id.into(),
            handler_name: handler_name.into(),
            spec,
            payload_template,
            priority: Priority::default(),
            max_attempts: None,
            last_fired_at: None,
            next_fire_at,
        })
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// The work item emitted for the firing at `instant`.
    pub fn work_for(&self, instant: DateTime<Utc>) -> NewWorkItem {
        let mut new = NewWorkItem::new(&self.handler_name, self.payload_template.clone())
            .priority(self.priority)
            .source(format!("schedule:{}", self.id))
            .trigger(instant.to_rfc3339());
        if let Some(n) = self.max_attempts {
            new = new.max_attempts(n);
        }
        new
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting new work items.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) handler_name: String,
    pub(crate) payload: Payload,
    pub(crate) priority: Priority,
    pub(crate) provenance: Provenance,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) not_before: Option<DateTime<Utc>>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl NewWorkItem {
    pub fn new(handler_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            handler_name: handler_name.into(),
            payload,
            priority: Priority::default(),
            provenance: Provenance::default(),
            max_attempts: None,
            not_before: None,
            expires_at: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// Delay eligibility until `at`.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Expire the item if it hasn't been leased by `at`.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.provenance.source = source.into();
        self
    }

    pub fn trigger(mut self, trigger: impl Into<String>) -> Self {
        self.provenance.trigger = Some(trigger.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn state_machine_allows_only_documented_edges() {
        use State::*;
        assert!(Pending.can_transition_to(Leased));
        assert!(Leased.can_transition_to(Pending));
        assert!(Leased.can_transition_to(Succeeded));
        assert!(Leased.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Expired));

        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Leased));
        assert!(!Expired.can_transition_to(Pending));
    }

    #[test]
    fn items_refuse_undocumented_transitions() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut item = WorkItem::from_new(NewWorkItem::new("h", Payload::default()), 3, now);
        assert!(matches!(
            item.transition(State::Succeeded),
            Err(crate::error::Error::InvalidTransition {
                from: State::Pending,
                to: State::Succeeded
            })
        ));
        assert_eq!(item.state, State::Pending);

        item.transition(State::Leased).unwrap();
        item.transition(State::Succeeded).unwrap();
        assert!(item.state.is_terminal());
        assert!(item.transition(State::Pending).is_err());
    }

    #[test]
    fn stats_count_every_state() {
        let mut stats = QueueStats::default();
        for (n, state) in State::ALL.into_iter().enumerate() {
            stats.add(state, n as u64 + 1);
        }
        for (n, state) in State::ALL.into_iter().enumerate() {
            assert_eq!(stats.count(state), n as u64 + 1);
        }
        assert_eq!(stats.total, 15);
    }

    #[test]
    fn priority_orders_highest_first() {
        let mut ps = vec![Priority::Low, Priority::Highest, Priority::Medium];
        ps.sort_by(|a, b| b.cmp(a));
        assert_eq!(ps, vec![Priority::Highest, Priority::Medium, Priority::Low]);
        assert_eq!("normal".parse::<Priority>().unwrap(), Priority::Medium);
        assert_eq!("4".parse::<Priority>().unwrap(), Priority::High);
        assert!("9".parse::<Priority>().is_err());
    }

    #[test]
    fn payload_decode_checks_version() {
        #[derive(Deserialize)]
        struct Args {
            n: u32,
        }
        let payload = Payload::versioned(2, serde_json::json!({"n": 7}));
        assert_eq!(payload.decode::<Args>(2).unwrap().n, 7);
        assert!(payload.decode::<Args>(1).is_err());
    }

    #[test]
    fn interval_next_is_relative_to_previous_instant() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let spec = ScheduleSpec::every(60);
        assert_eq!(spec.next_after(t0).unwrap(), t0 + Duration::seconds(60));
        assert!(ScheduleSpec::every(0).validate().is_err());
    }

    #[test]
    fn oversized_intervals_are_refused_up_front() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(ScheduleSpec::every(MAX_INTERVAL_SECS).validate().is_ok());
        for secs in [MAX_INTERVAL_SECS + 1, i64::MAX as u64 + 1, u64::MAX] {
            let spec = ScheduleSpec::every(secs);
            assert!(matches!(spec.validate(), Err(Error::InvalidSchedule(_))));
            assert!(matches!(spec.next_after(t0), Err(Error::InvalidSchedule(_))));
        }
    }

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 15).unwrap();
        let spec = ScheduleSpec::cron("*/15 * * * *");
        assert_eq!(
            spec.next_after(t0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 10, 45, 0).unwrap()
        );
        assert!(ScheduleSpec::cron("not a cron").validate().is_err());
    }

    #[test]
    fn from_new_clamps_max_attempts_to_one() {
        let now = Utc::now();
        let item = WorkItem::from_new(
            NewWorkItem::new("x", Payload::default()).max_attempts(0),
            3,
            now,
        );
        assert_eq!(item.max_attempts, 1);
        assert_eq!(item.state, State::Pending);
        assert!(item.is_ready(now));
    }
}
