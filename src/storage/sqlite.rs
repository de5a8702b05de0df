//! SQLite-backed durable store via sqlx.
//!
//! Every state change is a single `UPDATE ... WHERE <expected state>`
//! statement, so SQLite's writer lock makes it atomic across connections
//! and processes sharing the same database file.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::debug;

use super::{Broker, Enqueue, FailUpdate, RetryUpdate, ScheduleStore, sort_by_readiness};
use crate::error::{Error, Result};
use crate::model::*;

const WORK_COLUMNS: &str = "id, handler_name, payload, priority, state, source, trigger_info, \
     attempt_count, max_attempts, not_before, lease_expiry, lease_token, expires_at, \
     last_error, last_backoff_ms, created_at, updated_at, completed_at";

const SCHEDULE_COLUMNS: &str =
    "id, handler_name, spec, payload_template, priority, max_attempts, last_fired_at, next_fire_at";

/// Durable store. Owns the connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(StdDuration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database. One connection that never closes, so
    /// the data lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Work out why a leased-row update matched nothing.
    async fn explain_miss(&self, id: WorkId, token: LeaseToken, to: State) -> Error {
        let row: std::result::Result<Option<(String, Option<String>, i64, i64)>, _> =
            sqlx::query_as(
                "SELECT state, lease_token, attempt_count, max_attempts FROM work_items WHERE id = ?1",
            )
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await;

        match row {
            Err(e) => Error::Store(e),
            Ok(None) => Error::NotFound(format!("work item {id}")),
            Ok(Some((state, lease, _, _))) if state != "leased" || lease != Some(token.0.to_string()) => {
                Error::LeaseLost(id)
            }
            Ok(Some(_)) => Error::InvalidTransition {
                from: State::Leased,
                to,
            },
        }
    }
}

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(v: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(v).ok_or_else(|| Error::Other(format!("bad timestamp {v}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Payload(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| Error::Payload(e.to_string()))
}

#[async_trait]
impl Enqueue for SqliteStore {
    async fn enqueue(&self, item: WorkItem) -> Result<WorkItem> {
        sqlx::query(
            "INSERT INTO work_items (
                id, handler_name, payload, priority, state, source, trigger_info,
                attempt_count, max_attempts, not_before, lease_expiry, lease_token, expires_at,
                last_error, last_backoff_ms, created_at, updated_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL, ?11, ?12, ?13, ?14, ?15, NULL)",
        )
        .bind(item.id.0.to_string())
        .bind(&item.handler_name)
        .bind(to_json(&item.payload)?)
        .bind(item.priority.as_i32())
        .bind(State::Pending.as_str())
        .bind(&item.provenance.source)
        .bind(&item.provenance.trigger)
        .bind(i64::from(item.attempt_count))
        .bind(i64::from(item.max_attempts))
        .bind(ms(item.not_before))
        .bind(item.expires_at.map(ms))
        .bind(&item.last_error)
        .bind(item.last_backoff_ms.map(|v| v as i64))
        .bind(ms(item.created_at))
        .bind(ms(item.updated_at))
        .execute(&self.pool)
        .await?;

        self.get(item.id).await
    }
}

#[async_trait]
impl Broker for SqliteStore {
    async fn dequeue_batch(
        &self,
        n: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lease>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        // One token per batch; reports are checked on (id, token) so the
        // pair is still unique per lease.
        let token = LeaseToken::new();
        let expires_at = now + lease_duration;

        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items
             SET state = 'leased', lease_token = ?1, lease_expiry = ?2, updated_at = ?3
             WHERE id IN (
                 SELECT id FROM work_items
                 WHERE state = 'pending' AND not_before <= ?3
                   AND (expires_at IS NULL OR expires_at > ?3)
                 ORDER BY priority DESC, not_before ASC, created_at ASC
                 LIMIT ?4
             )
             RETURNING {WORK_COLUMNS}"
        ))
        .bind(token.0.to_string())
        .bind(ms(expires_at))
        .bind(ms(now))
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut leases = rows
            .into_iter()
            .map(|row| {
                row.try_into_work_item().map(|item| Lease {
                    item,
                    token,
                    expires_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        sort_by_readiness(&mut leases);
        debug!(count = leases.len(), "leased batch");
        Ok(leases)
    }

    async fn extend_lease(
        &self,
        id: WorkId,
        token: LeaseToken,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let expiry = now + duration;
        let rows = sqlx::query(
            "UPDATE work_items SET lease_expiry = ?1, updated_at = ?2
             WHERE id = ?3 AND state = 'leased' AND lease_token = ?4",
        )
        .bind(ms(expiry))
        .bind(ms(now))
        .bind(id.0.to_string())
        .bind(token.0.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(self.explain_miss(id, token, State::Leased).await);
        }
        Ok(expiry)
    }

    async fn complete(
        &self,
        id: WorkId,
        token: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items
             SET state = 'succeeded', attempt_count = MIN(attempt_count + 1, max_attempts),
                 lease_token = NULL, lease_expiry = NULL, updated_at = ?1, completed_at = ?1
             WHERE id = ?2 AND state = 'leased' AND lease_token = ?3
             RETURNING {WORK_COLUMNS}"
        ))
        .bind(ms(now))
        .bind(id.0.to_string())
        .bind(token.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into_work_item(),
            None => Err(self.explain_miss(id, token, State::Succeeded).await),
        }
    }

    async fn retry(
        &self,
        id: WorkId,
        token: LeaseToken,
        update: RetryUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items
             SET state = 'pending', attempt_count = attempt_count + 1, not_before = ?1,
                 last_error = ?2, last_backoff_ms = ?3,
                 lease_token = NULL, lease_expiry = NULL, updated_at = ?4
             WHERE id = ?5 AND state = 'leased' AND lease_token = ?6
               AND attempt_count + 1 < max_attempts
             RETURNING {WORK_COLUMNS}"
        ))
        .bind(ms(update.not_before))
        .bind(&update.error)
        .bind(update.backoff_ms as i64)
        .bind(ms(now))
        .bind(id.0.to_string())
        .bind(token.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into_work_item(),
            None => Err(self.explain_miss(id, token, State::Pending).await),
        }
    }

    async fn fail(
        &self,
        id: WorkId,
        token: LeaseToken,
        update: FailUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items
             SET state = 'failed',
                 attempt_count = MIN(attempt_count + ?1, max_attempts),
                 last_error = ?2,
                 lease_token = NULL, lease_expiry = NULL, updated_at = ?3, completed_at = ?3
             WHERE id = ?4 AND state = 'leased' AND lease_token = ?5
             RETURNING {WORK_COLUMNS}"
        ))
        .bind(if update.count_attempt { 1i64 } else { 0i64 })
        .bind(&update.error)
        .bind(ms(now))
        .bind(id.0.to_string())
        .bind(token.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into_work_item(),
            None => Err(self.explain_miss(id, token, State::Failed).await),
        }
    }

    async fn release(
        &self,
        id: WorkId,
        token: LeaseToken,
        not_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items
             SET state = 'pending', not_before = COALESCE(?1, not_before),
                 lease_token = NULL, lease_expiry = NULL, updated_at = ?2
             WHERE id = ?3 AND state = 'leased' AND lease_token = ?4
             RETURNING {WORK_COLUMNS}"
        ))
        .bind(not_before.map(ms))
        .bind(ms(now))
        .bind(id.0.to_string())
        .bind(token.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into_work_item(),
            None => Err(self.explain_miss(id, token, State::Pending).await),
        }
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut tx = self.pool.begin().await?;

        let released: Vec<(String,)> = sqlx::query_as(
            "UPDATE work_items
             SET state = 'pending', lease_token = NULL, lease_expiry = NULL, updated_at = ?1
             WHERE state = 'leased' AND lease_expiry <= ?1
             RETURNING id",
        )
        .bind(ms(now))
        .fetch_all(&mut *tx)
        .await?;

        let expired: Vec<(String,)> = sqlx::query_as(
            "UPDATE work_items
             SET state = 'expired', updated_at = ?1, completed_at = ?1
             WHERE state = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?1
             RETURNING id",
        )
        .bind(ms(now))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let parse = |rows: Vec<(String,)>| -> Result<Vec<WorkId>> {
            rows.into_iter().map(|(id,)| id.parse()).collect()
        };
        Ok(ReapReport {
            released: parse(released)?,
            expired: parse(expired)?,
        })
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> =
            sqlx::query_as(&format!("SELECT {WORK_COLUMNS} FROM work_items WHERE id = ?1"))
                .bind(id.0.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("work item {id}")))?
            .try_into_work_item()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM work_items GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            stats.add(state.parse()?, count as u64);
        }
        Ok(stats)
    }
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<ScheduleEntry> {
        let row: ScheduleRow = sqlx::query_as(&format!(
            "INSERT INTO schedules ({SCHEDULE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 handler_name = excluded.handler_name,
                 spec = excluded.spec,
                 payload_template = excluded.payload_template,
                 priority = excluded.priority,
                 max_attempts = excluded.max_attempts
             RETURNING {SCHEDULE_COLUMNS}"
        ))
        .bind(&entry.id)
        .bind(&entry.handler_name)
        .bind(to_json(&entry.spec)?)
        .bind(to_json(&entry.payload_template)?)
        .bind(entry.priority.as_i32())
        .bind(entry.max_attempts.map(i64::from))
        .bind(entry.last_fired_at.map(ms))
        .bind(ms(entry.next_fire_at))
        .fetch_one(&self.pool)
        .await?;

        row.try_into_entry()
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScheduleRow::try_into_entry).collect()
    }

    async fn remove_schedule(&self, id: &str) -> Result<()> {
        let rows = sqlx::query("DELETE FROM schedules WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(Error::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    async fn claim_fire(
        &self,
        id: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE schedules SET next_fire_at = ?1, last_fired_at = ?2
             WHERE id = ?3 AND next_fire_at = ?4",
        )
        .bind(ms(next))
        .bind(ms(fired_at))
        .bind(id)
        .bind(ms(expected))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 1 {
            return Ok(true);
        }

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM schedules WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("schedule {id}"))),
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    handler_name: String,
    payload: String,
    priority: i32,
    state: String,
    source: String,
    trigger_info: Option<String>,
    attempt_count: i64,
    max_attempts: i64,
    not_before: i64,
    lease_expiry: Option<i64>,
    lease_token: Option<String>,
    expires_at: Option<i64>,
    last_error: Option<String>,
    last_backoff_ms: Option<i64>,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        let lease_token = self
            .lease_token
            .map(|s| {
                uuid::Uuid::parse_str(&s)
                    .map(LeaseToken)
                    .map_err(|e| Error::Other(format!("bad lease token {s:?}: {e}")))
            })
            .transpose()?;

        Ok(WorkItem {
            id: self.id.parse()?,
            handler_name: self.handler_name,
            payload: from_json(&self.payload)?,
            priority: Priority::from_i32(self.priority)?,
            state: self.state.parse()?,
            provenance: Provenance {
                source: self.source,
                trigger: self.trigger_info,
            },
            attempt_count: self.attempt_count as u32,
            max_attempts: self.max_attempts as u32,
            not_before: from_ms(self.not_before)?,
            lease_expiry: self.lease_expiry.map(from_ms).transpose()?,
            lease_token,
            expires_at: self.expires_at.map(from_ms).transpose()?,
            last_error: self.last_error,
            last_backoff_ms: self.last_backoff_ms.map(|v| v as u64),
            created_at: from_ms(self.created_at)?,
            updated_at: from_ms(self.updated_at)?,
            completed_at: self.completed_at.map(from_ms).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    handler_name: String,
    spec: String,
    payload_template: String,
    priority: i32,
    max_attempts: Option<i64>,
    last_fired_at: Option<i64>,
    next_fire_at: i64,
}

impl ScheduleRow {
    fn try_into_entry(self) -> Result<ScheduleEntry> {
        Ok(ScheduleEntry {
            id: self.id,
            handler_name: self.handler_name,
            spec: from_json(&self.spec)?,
            payload_template: from_json(&self.payload_template)?,
            priority: Priority::from_i32(self.priority)?,
            max_attempts: self.max_attempts.map(|n| n as u32),
            last_fired_at: self.last_fired_at.map(from_ms).transpose()?,
            next_fire_at: from_ms(self.next_fire_at)?,
        })
    }
}
