//! Postgres-backed queue store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | PoolClosed, PoolTimedOut, Io | `Unavailable` |
//! | Database (any code) | `Storage` |
//! | Other | `Storage` |
//!
//! ## Sync bridge
//!
//! `QueueStore` is synchronous. Each call is driven to completion on the
//! runtime handle given at construction, so callers must not be on a
//! runtime worker thread (use `spawn_blocking` or a plain thread).

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use jobforge_core::{EntryId, FailedEntryId};

use super::store::{QueueStore, StoreError};
use super::types::{FailedEntry, NewEntry, QueueEntry, QueueStats};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_queue (
        id UUID PRIMARY KEY,
        work_type TEXT NOT NULL,
        state BYTEA NOT NULL,
        unique_key TEXT UNIQUE,
        trigger_at TIMESTAMPTZ NOT NULL,
        last_run_at TIMESTAMPTZ,
        is_manual BOOLEAN NOT NULL DEFAULT FALSE,
        priority INTEGER NOT NULL DEFAULT 100,
        attempts INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_queue_runnable_idx ON job_queue (is_manual, trigger_at)",
    r#"
    CREATE TABLE IF NOT EXISTS job_failed (
        id UUID PRIMARY KEY,
        work_type TEXT NOT NULL,
        state BYTEA NOT NULL,
        captured_error TEXT NOT NULL,
        failed_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_failed_failed_at_idx ON job_failed (failed_at)",
];

const ENTRY_COLUMNS: &str =
    "id, work_type, state, unique_key, trigger_at, last_run_at, is_manual, priority, attempts";

/// Postgres-backed queue store.
///
/// Uses the SQLx pool, so it is `Send + Sync` and cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Connect using the current runtime's handle.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, entry), fields(work_type = %entry.work_type), err)]
    pub async fn upsert_entry(&self, entry: NewEntry) -> Result<EntryId, StoreError> {
        // NULL keys never conflict, so keyless inserts take the plain path
        let id: uuid::Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO job_queue (
                id, work_type, state, unique_key, trigger_at,
                last_run_at, is_manual, priority, attempts
            )
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, 0)
            ON CONFLICT (unique_key) DO UPDATE SET
                work_type = EXCLUDED.work_type,
                state = EXCLUDED.state,
                trigger_at = CASE
                    WHEN job_queue.trigger_at = EXCLUDED.trigger_at
                        THEN EXCLUDED.trigger_at - INTERVAL '1 microsecond'
                    ELSE EXCLUDED.trigger_at
                END,
                last_run_at = NULL,
                is_manual = EXCLUDED.is_manual,
                priority = EXCLUDED.priority,
                attempts = 0
            RETURNING id
            "#,
        )
        .bind(*EntryId::new().as_uuid())
        .bind(&entry.work_type)
        .bind(&entry.state)
        .bind(&entry.unique_key)
        .bind(entry.trigger_at)
        .bind(entry.is_manual)
        .bind(entry.priority)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        Ok(EntryId::from_uuid(id))
    }

    pub async fn fetch_entry(&self, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM job_queue WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| entry_from_row(&r)).transpose()
    }

    pub async fn fetch_entry_by_key(
        &self,
        unique_key: &str,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM job_queue WHERE unique_key = $1"
        ))
        .bind(unique_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_key", e))?;
        row.map(|r| entry_from_row(&r)).transpose()
    }

    pub async fn fetch_runnable(
        &self,
        manual: bool,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM job_queue
            WHERE is_manual = $1 AND trigger_at <= $2
            ORDER BY priority DESC, trigger_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(manual)
        .bind(now)
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_runnable", e))?;
        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn claim_entry(
        &self,
        id: EntryId,
        observed: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE job_queue SET trigger_at = $3, last_run_at = $4 WHERE id = $1 AND trigger_at = $2",
        )
        .bind(*id.as_uuid())
        .bind(observed)
        .bind(claimed_until)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn revert_entry_claim(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        original: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE job_queue SET trigger_at = $3 WHERE id = $1 AND trigger_at = $2")
                .bind(*id.as_uuid())
                .bind(token)
                .bind(original)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("revert_claim", e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_claimed(&self, id: EntryId, token: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = $1 AND trigger_at = $2")
            .bind(*id.as_uuid())
            .bind(token)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete_claimed", e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn reschedule_entry(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        state: &[u8],
        trigger_at: DateTime<Utc>,
        increment_attempts: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET state = $3,
                trigger_at = $4,
                attempts = attempts + CASE WHEN $5 THEN 1 ELSE 0 END
            WHERE id = $1 AND trigger_at = $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(token)
        .bind(state)
        .bind(trigger_at)
        .bind(increment_attempts)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, failed), fields(failed_id = %failed.id), err)]
    pub async fn dead_letter_entry(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        failed: FailedEntry,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO job_failed (id, work_type, state, captured_error, failed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(*failed.id.as_uuid())
        .bind(&failed.work_type)
        .bind(&failed.state)
        .bind(&failed.captured_error)
        .bind(failed.failed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_failed", e))?;

        let deleted = sqlx::query("DELETE FROM job_queue WHERE id = $1 AND trigger_at = $2")
            .bind(*id.as_uuid())
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(deleted == 1)
    }

    pub async fn delete_entry(&self, id: EntryId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_entry_by_key(&self, unique_key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE unique_key = $1")
            .bind(unique_key)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_by_key", e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn fetch_failed(&self, limit: usize) -> Result<Vec<FailedEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, work_type, state, captured_error, failed_at
            FROM job_failed
            ORDER BY failed_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_failed", e))?;

        rows.iter()
            .map(|r| FailedRow::from_row(r).map(FailedEntry::from))
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::Storage(format!("failed to decode failed row: {e}")))
    }

    pub async fn fetch_failed_by_id(
        &self,
        id: FailedEntryId,
    ) -> Result<Option<FailedEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT id, work_type, state, captured_error, failed_at FROM job_failed WHERE id = $1",
        )
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_failed", e))?;

        row.map(|r| FailedRow::from_row(&r).map(FailedEntry::from))
            .transpose()
            .map_err(|e| StoreError::Storage(format!("failed to decode failed row: {e}")))
    }

    pub async fn delete_failed_entry(&self, id: FailedEntryId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM job_failed WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_failed", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    pub async fn prune_failed_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM job_failed WHERE failed_at < $1")
            .bind(before)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("prune_failed", e))?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_next_automatic_trigger(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        sqlx::query_scalar("SELECT MIN(trigger_at) FROM job_queue WHERE NOT is_manual")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("next_automatic_trigger", e))
    }

    pub async fn fetch_stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE is_manual) AS manual_pending,
                COUNT(*) FILTER (WHERE NOT is_manual) AS automatic_pending,
                COUNT(*) FILTER (WHERE NOT is_manual AND trigger_at <= $1) AS automatic_runnable,
                MIN(trigger_at) FILTER (WHERE NOT is_manual) AS next_automatic_trigger,
                (SELECT COUNT(*) FROM job_failed) AS failed
            FROM job_queue
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let n: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(u64::try_from(n).unwrap_or_default())
        };

        Ok(QueueStats {
            manual_pending: count("manual_pending")?,
            automatic_pending: count("automatic_pending")?,
            automatic_runnable: count("automatic_runnable")?,
            failed: count("failed")?,
            next_automatic_trigger: row
                .try_get("next_automatic_trigger")
                .map_err(|e| map_sqlx_error("stats", e))?,
        })
    }

    pub async fn fetch_overdue(
        &self,
        manual: bool,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM job_queue
            WHERE is_manual = $1 AND trigger_at < $2
            ORDER BY trigger_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(manual)
        .bind(before)
        .bind(to_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("overdue", e))?;
        rows.iter().map(entry_from_row).collect()
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

impl QueueStore for PostgresQueueStore {
    fn upsert(&self, entry: NewEntry) -> Result<EntryId, StoreError> {
        self.block_on(self.upsert_entry(entry))
    }

    fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        self.block_on(self.fetch_entry(id))
    }

    fn get_by_key(&self, unique_key: &str) -> Result<Option<QueueEntry>, StoreError> {
        self.block_on(self.fetch_entry_by_key(unique_key))
    }

    fn select_runnable(
        &self,
        manual: bool,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        self.block_on(self.fetch_runnable(manual, now, limit))
    }

    fn claim(
        &self,
        id: EntryId,
        observed: DateTime<Utc>,
        claimed_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.block_on(self.claim_entry(id, observed, claimed_until, now))
    }

    fn revert_claim(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        original: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.block_on(self.revert_entry_claim(id, token, original))
    }

    fn complete_claimed(&self, id: EntryId, token: DateTime<Utc>) -> Result<bool, StoreError> {
        self.block_on(self.delete_claimed(id, token))
    }

    fn reschedule(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        state: &[u8],
        trigger_at: DateTime<Utc>,
        increment_attempts: bool,
    ) -> Result<bool, StoreError> {
        self.block_on(self.reschedule_entry(id, token, state, trigger_at, increment_attempts))
    }

    fn dead_letter(
        &self,
        id: EntryId,
        token: DateTime<Utc>,
        failed: FailedEntry,
    ) -> Result<bool, StoreError> {
        self.block_on(self.dead_letter_entry(id, token, failed))
    }

    fn delete(&self, id: EntryId) -> Result<bool, StoreError> {
        self.block_on(self.delete_entry(id))
    }

    fn delete_by_key(&self, unique_key: &str) -> Result<bool, StoreError> {
        self.block_on(self.delete_entry_by_key(unique_key))
    }

    fn list_failed(&self, limit: usize) -> Result<Vec<FailedEntry>, StoreError> {
        self.block_on(self.fetch_failed(limit))
    }

    fn get_failed(&self, id: FailedEntryId) -> Result<Option<FailedEntry>, StoreError> {
        self.block_on(self.fetch_failed_by_id(id))
    }

    fn delete_failed(&self, id: FailedEntryId) -> Result<bool, StoreError> {
        self.block_on(self.delete_failed_entry(id))
    }

    fn prune_failed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.block_on(self.prune_failed_before(before))
    }

    fn next_automatic_trigger(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.block_on(self.fetch_next_automatic_trigger())
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        self.block_on(self.fetch_stats(now))
    }

    fn overdue(
        &self,
        manual: bool,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        self.block_on(self.fetch_overdue(manual, before, limit))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("i/o error in {operation}: {e}")),
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// SQLx row types

#[derive(Debug)]
struct EntryRow {
    id: uuid::Uuid,
    work_type: String,
    state: Vec<u8>,
    unique_key: Option<String>,
    trigger_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    is_manual: bool,
    priority: i32,
    attempts: i32,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EntryRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EntryRow {
            id: row.try_get("id")?,
            work_type: row.try_get("work_type")?,
            state: row.try_get("state")?,
            unique_key: row.try_get("unique_key")?,
            trigger_at: row.try_get("trigger_at")?,
            last_run_at: row.try_get("last_run_at")?,
            is_manual: row.try_get("is_manual")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
        })
    }
}

impl From<EntryRow> for QueueEntry {
    fn from(row: EntryRow) -> Self {
        QueueEntry {
            id: EntryId::from_uuid(row.id),
            work_type: row.work_type,
            state: row.state,
            unique_key: row.unique_key,
            trigger_at: row.trigger_at,
            last_run_at: row.last_run_at,
            is_manual: row.is_manual,
            priority: row.priority,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
        }
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<QueueEntry, StoreError> {
    EntryRow::from_row(row)
        .map(QueueEntry::from)
        .map_err(|e| StoreError::Storage(format!("failed to decode queue row: {e}")))
}

#[derive(Debug)]
struct FailedRow {
    id: uuid::Uuid,
    work_type: String,
    state: Vec<u8>,
    captured_error: String,
    failed_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for FailedRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(FailedRow {
            id: row.try_get("id")?,
            work_type: row.try_get("work_type")?,
            state: row.try_get("state")?,
            captured_error: row.try_get("captured_error")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

impl From<FailedRow> for FailedEntry {
    fn from(row: FailedRow) -> Self {
        FailedEntry {
            id: FailedEntryId::from_uuid(row.id),
            work_type: row.work_type,
            state: row.state,
            captured_error: row.captured_error,
            failed_at: row.failed_at,
        }
    }
}
