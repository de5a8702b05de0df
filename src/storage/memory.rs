//! In-process store. One mutex guards all rows, which makes every
//! operation trivially atomic. State does not survive the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{Broker, Enqueue, FailUpdate, RetryUpdate, ScheduleStore, sort_by_readiness};
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Default)]
struct Inner {
    items: HashMap<WorkId, WorkItem>,
    schedules: HashMap<String, ScheduleEntry>,
}

/// Mutex-guarded store for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, every operation fails with
    /// `Error::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory store offline".to_string()));
        }
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Find the item and check the caller still holds its lease.
fn leased_mut(
    items: &mut HashMap<WorkId, WorkItem>,
    id: WorkId,
    token: LeaseToken,
) -> Result<&mut WorkItem> {
    let item = items
        .get_mut(&id)
        .ok_or_else(|| Error::NotFound(format!("work item {id}")))?;
    if item.state != State::Leased || item.lease_token != Some(token) {
        return Err(Error::LeaseLost(id));
    }
    Ok(item)
}

fn clear_lease(item: &mut WorkItem) {
    item.lease_expiry = None;
    item.lease_token = None;
}

#[async_trait]
impl Enqueue for MemoryStore {
    async fn enqueue(&self, item: WorkItem) -> Result<WorkItem> {
        let mut inner = self.lock()?;
        if inner.items.contains_key(&item.id) {
            return Err(Error::Other(format!("duplicate work id {}", item.id)));
        }
        // New rows always start out pending and unleased.
        let mut item = item;
        item.state = State::Pending;
        clear_lease(&mut item);
        item.completed_at = None;
        inner.items.insert(item.id, item.clone());
        Ok(item)
    }
}

#[async_trait]
impl Broker for MemoryStore {
    async fn dequeue_batch(
        &self,
        n: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lease>> {
        let mut inner = self.lock()?;
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut ready: Vec<&WorkItem> = inner.items.values().filter(|i| i.is_ready(now)).collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.not_before.cmp(&b.not_before))
                .then(a.created_at.cmp(&b.created_at))
        });
        let chosen: Vec<WorkId> = ready.into_iter().take(n).map(|i| i.id).collect();

        let expires_at = now + lease_duration;
        let mut leases = Vec::with_capacity(chosen.len());
        for id in chosen {
            if let Some(item) = inner.items.get_mut(&id) {
                let token = LeaseToken::new();
                item.transition(State::Leased)?;
                item.lease_token = Some(token);
                item.lease_expiry = Some(expires_at);
                item.updated_at = now;
                leases.push(Lease {
                    item: item.clone(),
                    token,
                    expires_at,
                });
            }
        }
        sort_by_readiness(&mut leases);
        Ok(leases)
    }

    async fn extend_lease(
        &self,
        id: WorkId,
        token: LeaseToken,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut inner = self.lock()?;
        let item = leased_mut(&mut inner.items, id, token)?;
        let expiry = now + duration;
        item.lease_expiry = Some(expiry);
        item.updated_at = now;
        Ok(expiry)
    }

    async fn complete(
        &self,
        id: WorkId,
        token: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let mut inner = self.lock()?;
        let item = leased_mut(&mut inner.items, id, token)?;
        item.transition(State::Succeeded)?;
        item.attempt_count = (item.attempt_count + 1).min(item.max_attempts);
        clear_lease(item);
        item.updated_at = now;
        item.completed_at = Some(now);
        Ok(item.clone())
    }

    async fn retry(
        &self,
        id: WorkId,
        token: LeaseToken,
        update: RetryUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let mut inner = self.lock()?;
        let item = leased_mut(&mut inner.items, id, token)?;
        if item.attempt_count + 1 >= item.max_attempts {
            return Err(Error::InvalidTransition {
                from: State::Leased,
                to: State::Pending,
            });
        }
        item.transition(State::Pending)?;
        item.attempt_count += 1;
        item.not_before = update.not_before;
        item.last_error = Some(update.error);
        item.last_backoff_ms = Some(update.backoff_ms);
        clear_lease(item);
        item.updated_at = now;
        Ok(item.clone())
    }

    async fn fail(
        &self,
        id: WorkId,
        token: LeaseToken,
        update: FailUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let mut inner = self.lock()?;
        let item = leased_mut(&mut inner.items, id, token)?;
        item.transition(State::Failed)?;
        if update.count_attempt {
            item.attempt_count = (item.attempt_count + 1).min(item.max_attempts);
        }
        item.last_error = Some(update.error);
        clear_lease(item);
        item.updated_at = now;
        item.completed_at = Some(now);
        Ok(item.clone())
    }

    async fn release(
        &self,
        id: WorkId,
        token: LeaseToken,
        not_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let mut inner = self.lock()?;
        let item = leased_mut(&mut inner.items, id, token)?;
        item.transition(State::Pending)?;
        if let Some(at) = not_before {
            item.not_before = at;
        }
        clear_lease(item);
        item.updated_at = now;
        Ok(item.clone())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut inner = self.lock()?;
        let mut report = ReapReport::default();
        for item in inner.items.values_mut() {
            match item.state {
                State::Leased if item.lease_expiry.is_some_and(|at| at <= now) => {
                    item.transition(State::Pending)?;
                    clear_lease(item);
                    item.updated_at = now;
                    report.released.push(item.id);
                }
                State::Pending if item.expires_at.is_some_and(|at| at <= now) => {
                    item.transition(State::Expired)?;
                    item.updated_at = now;
                    item.completed_at = Some(now);
                    report.expired.push(item.id);
                }
                _ => {}
            }
        }
        Ok(report)
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        let inner = self.lock()?;
        inner
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.lock()?;
        let mut stats = QueueStats::default();
        for item in inner.items.values() {
            stats.add(item.state, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<ScheduleEntry> {
        let mut inner = self.lock()?;
        let stored = match inner.schedules.remove(&entry.id) {
            Some(existing) => ScheduleEntry {
                last_fired_at: existing.last_fired_at,
                next_fire_at: existing.next_fire_at,
                ..entry
            },
            None => entry,
        };
        inner.schedules.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        let inner = self.lock()?;
        let mut entries: Vec<ScheduleEntry> = inner.schedules.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn remove_schedule(&self, id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .schedules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))
    }

    async fn claim_fire(
        &self,
        id: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let entry = inner
            .schedules
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))?;
        if entry.next_fire_at != expected {
            return Ok(false);
        }
        entry.next_fire_at = next;
        entry.last_fired_at = Some(fired_at);
        Ok(true)
    }
}
