//! Work item store and broker contract.
//!
//! Single source of truth for work item and schedule state. Every mutation
//! is a compare-and-swap on the row's current state (and lease token), so
//! concurrent dispatchers never observe the same item as eligible and
//! concurrent schedulers never claim the same firing twice.
//!
//! Two backends implement the contract:
//! - [`MemoryStore`]: mutex-guarded maps, for tests and embedded use.
//! - [`SqliteStore`]: durable, sqlx-backed, survives process restarts.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::model::*;

/// The one capability producers (API layer, scheduler) need.
#[async_trait]
pub trait Enqueue: Send + Sync {
    /// Durably store a `Pending` item. It becomes visible to dequeue once
    /// `now >= not_before`.
    async fn enqueue(&self, item: WorkItem) -> Result<WorkItem>;
}

/// Queue operations used by the dispatcher, workers and retry manager.
///
/// Every method taking a [`LeaseToken`] fails with `Error::LeaseLost` when
/// the item is no longer leased under that token.
#[async_trait]
pub trait Broker: Enqueue {
    /// Atomically lease up to `n` ready items ordered by
    /// `(priority desc, not_before asc)`.
    async fn dequeue_batch(
        &self,
        n: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lease>>;

    /// Push the lease expiry out to `now + duration`.
    async fn extend_lease(
        &self,
        id: WorkId,
        token: LeaseToken,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>>;

    /// Leased → Succeeded. Counts the attempt.
    async fn complete(&self, id: WorkId, token: LeaseToken, now: DateTime<Utc>)
    -> Result<WorkItem>;

    /// Leased → Pending after a failed attempt. Counts the attempt and
    /// delays eligibility until `not_before`.
    async fn retry(
        &self,
        id: WorkId,
        token: LeaseToken,
        update: RetryUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkItem>;

    /// Leased → Failed (terminal).
    async fn fail(
        &self,
        id: WorkId,
        token: LeaseToken,
        update: FailUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkItem>;

    /// Leased → Pending without counting an attempt.
    async fn release(
        &self,
        id: WorkId,
        token: LeaseToken,
        not_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<WorkItem>;

    /// Return stale leases to `Pending` (attempt not counted) and expire
    /// overdue pending items.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapReport>;

    async fn get(&self, id: WorkId) -> Result<WorkItem>;

    async fn stats(&self) -> Result<QueueStats>;
}

/// Durable schedule cursors.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert an entry, or update its definition while keeping the stored
    /// firing cursor. Returns the entry as stored.
    async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<ScheduleEntry>;

    async fn list_schedules(&self) -> Result<Vec<ScheduleEntry>>;

    async fn remove_schedule(&self, id: &str) -> Result<()>;

    /// Compare-and-swap `next_fire_at` from `expected` to `next`. Returns
    /// false when another scheduler already claimed the firing.
    async fn claim_fire(
        &self,
        id: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool>;
}

/// What the retry manager writes when re-enqueueing a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryUpdate {
    pub error: String,
    pub not_before: DateTime<Utc>,
    pub backoff_ms: u64,
}

/// What the retry manager writes when an item fails for good.
#[derive(Debug, Clone)]
pub struct FailUpdate {
    pub error: String,
    /// False when the handler never ran (unknown handler).
    pub count_attempt: bool,
}

/// Sort leased items the way they were selected.
pub(crate) fn sort_by_readiness(leases: &mut [Lease]) {
    leases.sort_by(|a, b| {
        b.item
            .priority
            .cmp(&a.item.priority)
            .then(a.item.not_before.cmp(&b.item.not_before))
            .then(a.item.created_at.cmp(&b.item.created_at))
    });
}
