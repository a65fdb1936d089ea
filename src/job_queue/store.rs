//! Job storage and persistence.
//!
//! Provides the SQLite-backed job table and the named lease table. Every
//! status change is a conditional `UPDATE` whose `WHERE` clause requires the
//! row to be in one of the source statuses of the corresponding
//! [`JobEvent`], so a write that lost a race simply affects zero rows.

use super::clock::{Clock, SystemClock};
use super::models::*;
use super::schema::JOB_QUEUE_VERSIONED_SCHEMAS;
use super::state_machine::{failure_status_sql, status_in, JobEvent};
use crate::sqlite_persistence::{read_schema_version, BASE_DB_VERSION};
use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, ToSql, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// How many times a claim re-selects candidates after losing rows to
/// another claimer.
const MAX_CLAIM_ROUNDS: usize = 5;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait for job storage operations.
///
/// Methods returning `bool` or `Option` report whether the conditional write
/// applied. `Err` means the store could not be reached and nothing can be
/// assumed about the row.
pub trait JobStore: Send + Sync {
    /// Current time according to the store's clock.
    fn now(&self) -> i64;

    // === Jobs ===

    /// Insert a validated job. Returns the new id.
    fn insert_job(&self, job: &NewJob, max_attempts: i32) -> Result<i64>;

    fn get_job(&self, id: i64) -> Result<Option<Job>>;

    /// List jobs matching the filter, newest first.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    fn count_jobs(&self, filter: &JobFilter) -> Result<usize>;

    // === State Transitions (atomic) ===

    /// Select and claim up to `limit` eligible jobs in dequeue order.
    fn claim_next(&self, limit: usize) -> Result<Vec<Job>>;

    /// Claim one specific job if it is eligible right now.
    fn claim_job(&self, id: i64) -> Result<bool>;

    /// processing → done, storing the result.
    fn complete_job(&self, id: i64, result: Option<&[u8]>) -> Result<bool>;

    /// processing → pending or failed, consuming an attempt.
    /// Returns the new status.
    fn record_failure(&self, id: i64, error: &str) -> Result<Option<JobStatus>>;

    /// processing → failed regardless of remaining attempts.
    fn fail_job(&self, id: i64, error: &str) -> Result<bool>;

    /// processing → delayed until `retry_at`, without consuming an attempt.
    fn delay_job(&self, id: i64, retry_at: i64, reason: &str) -> Result<bool>;

    /// pending/scheduled/delayed → cancelled.
    fn cancel_job(&self, id: i64, reason: &str) -> Result<bool>;

    /// failed → pending with attempts reset.
    fn reset_failed_job(&self, id: i64) -> Result<bool>;

    /// Reset every failed job selected by the filter. Returns the ids reset.
    fn reset_failed_jobs(&self, filter: &RetryFilter) -> Result<Vec<i64>>;

    // === Recovery ===

    /// Jobs in `processing` whose last update is older than `stale_before`.
    fn find_stale_processing(&self, stale_before: i64) -> Result<Vec<Job>>;

    /// Move a stale processing job back to pending, or to failed when it has
    /// no attempts left. The write re-checks status and staleness.
    fn recover_stale_job(
        &self,
        id: i64,
        stale_before: i64,
        error: &str,
        count_attempt: bool,
    ) -> Result<Option<JobStatus>>;

    /// Fix rows that violate the job invariants, in one transaction.
    fn repair(&self) -> Result<RepairReport>;

    /// Delete terminal jobs that finished before `cutoff`. Returns the count deleted.
    fn delete_finished_before(&self, cutoff: i64) -> Result<usize>;

    /// Delete all jobs, or all jobs in one status. Returns the count deleted.
    fn delete_jobs(&self, status: Option<JobStatus>) -> Result<usize>;

    // === Statistics ===

    fn get_stats(&self) -> Result<QueueStats>;

    // === Leases ===

    /// Take the named lease if it is free or expired.
    fn try_acquire_lease(&self, name: &str, holder: &str, ttl_secs: i64) -> Result<bool>;

    /// Extend a live lease owned by `holder`.
    fn renew_lease(&self, name: &str, holder: &str, ttl_secs: i64) -> Result<bool>;

    /// Drop the named lease. With a holder, only that holder's lease is dropped.
    fn release_lease(&self, name: &str, holder: Option<&str>) -> Result<bool>;

    fn get_lease(&self, name: &str) -> Result<Option<Lease>>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteJobStore {
    /// Opens an existing database or creates a new one with the current schema.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| format!("Failed to open job database {:?}", db_path.as_ref()))?
        } else {
            let conn = Connection::open(&db_path)
                .with_context(|| format!("Failed to create job database {:?}", db_path.as_ref()))?;
            JOB_QUEUE_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new job database at {:?}", db_path.as_ref());
            conn
        };

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let version = read_schema_version(&conn)?;
        let schema_count = JOB_QUEUE_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Job database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        JOB_QUEUE_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Create an in-memory store, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        JOB_QUEUE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used for every timestamp the store writes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = JOB_QUEUE_VERSIONED_SCHEMAS.len() - 1;

        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating job database from version {} to {}",
            current_version, target_version
        );

        for schema in JOB_QUEUE_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!("Running job database migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }

        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Job store connection mutex poisoned"))
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let raw_status: String = row.get("status")?;
        let status = JobStatus::parse(&raw_status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown job status {:?}", raw_status).into(),
            )
        })?;

        Ok(Job {
            id: row.get("id")?,
            job_type: row.get("type")?,
            status,
            payload: row.get("payload")?,
            result: row.get("result")?,
            priority: row.get("priority")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            error_message: row.get("error_message")?,
            scheduled_at: row.get("scheduled_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn fetch_job(conn: &Connection, id: i64) -> Result<Option<Job>> {
        let job = conn
            .prepare_cached("SELECT * FROM jobs WHERE id = ?1")?
            .query_row([id], Self::row_to_job)
            .optional()?;
        Ok(job)
    }

    fn query_ids(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Candidate ids in dequeue order: due scheduled/delayed jobs first, then
    /// pending jobs with attempts left.
    fn select_candidates(conn: &Connection, now: i64, limit: usize) -> Result<Vec<i64>> {
        let mut ids = Self::query_ids(
            conn,
            "SELECT id FROM jobs
             WHERE status IN ('scheduled', 'delayed')
               AND scheduled_at IS NOT NULL AND scheduled_at <= ?1
             ORDER BY priority DESC, scheduled_at ASC, id ASC
             LIMIT ?2",
            params![now, sql_limit(limit)],
        )?;

        if ids.len() < limit {
            let remaining = sql_limit(limit - ids.len());
            ids.extend(Self::query_ids(
                conn,
                "SELECT id FROM jobs
                 WHERE status = 'pending' AND attempts < max_attempts
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT ?1",
                params![remaining],
            )?);
        }

        Ok(ids)
    }

    /// Conditional claim of one row. ?1 is the id, ?2 the current time.
    fn claim_row(conn: &Connection, id: i64, now: i64) -> Result<bool> {
        let sql = format!(
            "UPDATE jobs SET status = 'processing', started_at = ?2, updated_at = ?2
             WHERE id = ?1 AND {}
               AND ((status = 'pending' AND attempts < max_attempts)
                 OR (status <> 'pending' AND scheduled_at IS NOT NULL AND scheduled_at <= ?2))",
            JobEvent::Dequeue.source_condition()
        );
        let changed = conn
            .execute(&sql, params![id, now])
            .with_context(|| format!("Failed to claim job {}", id))?;
        Ok(changed == 1)
    }

    /// Apply `event` to one job. `assignments` may use ?1 (id), ?2 (now)
    /// and ?3.. for `extra` parameters.
    fn apply_event(
        conn: &Connection,
        event: JobEvent,
        id: i64,
        now: i64,
        assignments: &str,
        extra: &[&dyn ToSql],
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE jobs SET {}, updated_at = ?2 WHERE id = ?1 AND {}",
            assignments,
            event.source_condition()
        );
        let mut params: Vec<&dyn ToSql> = vec![&id, &now];
        params.extend_from_slice(extra);

        let changed = conn
            .execute(&sql, params.as_slice())
            .with_context(|| format!("Failed to apply {:?} to job {}", event, id))?;
        if changed == 0 {
            debug!("{:?} did not apply to job {}", event, id);
        }
        Ok(changed == 1)
    }

    /// processing → pending/failed. `increment` is the number of attempts
    /// consumed (0 or 1); `stale_before` additionally requires the row to be stale.
    fn apply_failure(
        conn: &Connection,
        id: i64,
        now: i64,
        error: &str,
        increment: i32,
        stale_before: Option<i64>,
    ) -> Result<Option<JobStatus>> {
        let sql = format!(
            "UPDATE jobs SET
                 attempts = MIN(attempts + ?4, max_attempts),
                 status = {},
                 completed_at = CASE WHEN attempts + ?4 >= max_attempts THEN ?2 ELSE NULL END,
                 error_message = ?3,
                 updated_at = ?2
             WHERE id = ?1 AND {}
               AND (?5 IS NULL OR updated_at < ?5)
             RETURNING status",
            failure_status_sql("attempts + ?4"),
            JobEvent::Fail.source_condition()
        );

        let status: Option<String> = conn
            .query_row(
                &sql,
                params![id, now, error, increment, stale_before],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to record failure of job {}", id))?;

        Ok(status.as_deref().and_then(JobStatus::parse))
    }

    fn filter_clause(filter: &JobFilter) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            params.push(Box::new(status.as_str().to_string()));
            conditions.push(format!("status = ?{}", params.len()));
        }
        if let Some(job_type) = &filter.job_type {
            params.push(Box::new(job_type.clone()));
            conditions.push(format!("type = ?{}", params.len()));
        }
        if let Some(after) = filter.created_after {
            params.push(Box::new(after));
            conditions.push(format!("created_at >= ?{}", params.len()));
        }
        if let Some(before) = filter.created_before {
            params.push(Box::new(before));
            conditions.push(format!("created_at < ?{}", params.len()));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        (clause, params)
    }
}

impl JobStore for SqliteJobStore {
    fn now(&self) -> i64 {
        self.clock.now()
    }

    // === Jobs ===

    fn insert_job(&self, job: &NewJob, max_attempts: i32) -> Result<i64> {
        let now = self.clock.now();
        let completed_at = job.status.is_terminal().then_some(now);

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (
                type, status, payload, priority, attempts, max_attempts,
                scheduled_at, completed_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?8)",
            params![
                job.job_type,
                job.status.as_str(),
                job.payload,
                job.priority,
                max_attempts,
                job.scheduled_at,
                completed_at,
                now,
            ],
        )
        .with_context(|| format!("Failed to insert job of type {}", job.job_type))?;

        Ok(conn.last_insert_rowid())
    }

    fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.conn()?;
        Self::fetch_job(&conn, id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let (clause, mut params) = Self::filter_clause(filter);
        params.push(Box::new(sql_limit(filter.limit)));
        let limit_idx = params.len();
        params.push(Box::new(sql_limit(filter.offset)));
        let offset_idx = params.len();

        let sql = format!(
            "SELECT * FROM jobs{} ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
            clause, limit_idx, offset_idx
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let jobs = stmt
            .query_map(params_refs.as_slice(), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(jobs)
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<usize> {
        let (clause, params) = Self::filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs{}", clause);

        let conn = self.conn()?;
        let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let count: i64 = conn.query_row(&sql, params_refs.as_slice(), |row| row.get(0))?;

        Ok(count as usize)
    }

    // === State Transitions (atomic) ===

    fn claim_next(&self, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin claim transaction")?;

        let mut claimed: Vec<i64> = Vec::new();
        for _ in 0..MAX_CLAIM_ROUNDS {
            let remaining = limit - claimed.len();
            if remaining == 0 {
                break;
            }
            let candidates = Self::select_candidates(&tx, now, remaining)?;
            if candidates.is_empty() {
                break;
            }
            for id in candidates {
                if Self::claim_row(&tx, id, now)? {
                    claimed.push(id);
                } else {
                    debug!("Job {} was claimed elsewhere, trying next candidate", id);
                }
            }
        }

        let mut jobs = Vec::with_capacity(claimed.len());
        for id in claimed {
            if let Some(job) = Self::fetch_job(&tx, id)? {
                jobs.push(job);
            }
        }
        tx.commit().context("Failed to commit claim transaction")?;

        Ok(jobs)
    }

    fn claim_job(&self, id: i64) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.conn()?;
        Self::claim_row(&conn, id, now)
    }

    fn complete_job(&self, id: i64, result: Option<&[u8]>) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.conn()?;
        Self::apply_event(
            &conn,
            JobEvent::Succeed,
            id,
            now,
            "status = 'done', result = ?3, completed_at = ?2",
            params![result],
        )
    }

    fn record_failure(&self, id: i64, error: &str) -> Result<Option<JobStatus>> {
        let now = self.clock.now();
        let conn = self.conn()?;
        Self::apply_failure(&conn, id, now, error, 1, None)
    }

    fn fail_job(&self, id: i64, error: &str) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.conn()?;
        Self::apply_event(
            &conn,
            JobEvent::FailFatal,
            id,
            now,
            "status = 'failed', attempts = MIN(attempts + 1, max_attempts),
             error_message = ?3, completed_at = ?2",
            params![error],
        )
    }

    fn delay_job(&self, id: i64, retry_at: i64, reason: &str) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.conn()?;
        Self::apply_event(
            &conn,
            JobEvent::Delay,
            id,
            now,
            "status = 'delayed', scheduled_at = ?3, error_message = ?4",
            params![retry_at, reason],
        )
    }

    fn cancel_job(&self, id: i64, reason: &str) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.conn()?;
        Self::apply_event(
            &conn,
            JobEvent::Cancel,
            id,
            now,
            "status = 'cancelled', error_message = ?3, completed_at = ?2",
            params![reason],
        )
    }

    fn reset_failed_job(&self, id: i64) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.conn()?;
        Self::apply_event(&conn, JobEvent::Retry, id, now, RETRY_ASSIGNMENTS, &[])
    }

    fn reset_failed_jobs(&self, filter: &RetryFilter) -> Result<Vec<i64>> {
        if filter.limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();

        let mut conditions = vec![status_in(JobEvent::Retry.sources())];
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(job_type) = &filter.job_type {
            params.push(Box::new(job_type.clone()));
            conditions.push(format!("type = ?{}", params.len()));
        }
        if let Some(before) = filter.failed_before {
            params.push(Box::new(before));
            conditions.push(format!(
                "COALESCE(completed_at, updated_at) < ?{}",
                params.len()
            ));
        }
        params.push(Box::new(sql_limit(filter.limit)));
        let sql = format!(
            "SELECT id FROM jobs WHERE {} ORDER BY id ASC LIMIT ?{}",
            conditions.join(" AND "),
            params.len()
        );

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin retry transaction")?;

        let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let candidates = Self::query_ids(&tx, &sql, &params_refs)?;

        let mut reset = Vec::with_capacity(candidates.len());
        for id in candidates {
            if Self::apply_event(&tx, JobEvent::Retry, id, now, RETRY_ASSIGNMENTS, &[])? {
                reset.push(id);
            }
        }
        tx.commit().context("Failed to commit retry transaction")?;

        Ok(reset)
    }

    // === Recovery ===

    fn find_stale_processing(&self, stale_before: i64) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs
             WHERE status = 'processing' AND updated_at < ?1
             ORDER BY updated_at ASC, id ASC",
        )?;
        let jobs = stmt
            .query_map([stale_before], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn recover_stale_job(
        &self,
        id: i64,
        stale_before: i64,
        error: &str,
        count_attempt: bool,
    ) -> Result<Option<JobStatus>> {
        let now = self.clock.now();
        let conn = self.conn()?;
        Self::apply_failure(
            &conn,
            id,
            now,
            error,
            i32::from(count_attempt),
            Some(stale_before),
        )
    }

    fn repair(&self) -> Result<RepairReport> {
        let now = self.clock.now();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin repair transaction")?;

        let orphaned_processing = tx.execute(
            "UPDATE jobs SET status = 'pending', updated_at = ?1
             WHERE status = 'processing' AND started_at IS NULL",
            [now],
        )?;

        let unscheduled = tx.execute(
            "UPDATE jobs SET status = 'pending', updated_at = ?1
             WHERE status IN ('scheduled', 'delayed') AND scheduled_at IS NULL",
            [now],
        )?;

        let attempts_overflow = tx.execute(
            "UPDATE jobs SET
                 attempts = MIN(attempts, max_attempts),
                 status = CASE WHEN status IN ('done', 'cancelled') THEN status ELSE 'failed' END,
                 error_message = COALESCE(error_message, 'Maximum attempts exceeded'),
                 completed_at = COALESCE(completed_at, ?1),
                 updated_at = ?1
             WHERE attempts > max_attempts
                OR (status = 'pending' AND attempts >= max_attempts)",
            [now],
        )?;

        let missing_completed_at = tx.execute(
            &format!(
                "UPDATE jobs SET completed_at = ?1, updated_at = ?1
                 WHERE {} AND completed_at IS NULL",
                status_in(&[JobStatus::Done, JobStatus::Failed, JobStatus::Cancelled])
            ),
            [now],
        )?;

        tx.commit().context("Failed to commit repair transaction")?;

        Ok(RepairReport {
            orphaned_processing,
            unscheduled,
            attempts_overflow,
            missing_completed_at,
        })
    }

    fn delete_finished_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!(
                "DELETE FROM jobs WHERE {} AND COALESCE(completed_at, updated_at) < ?1",
                status_in(&[JobStatus::Done, JobStatus::Failed, JobStatus::Cancelled])
            ),
            [cutoff],
        )?;
        Ok(deleted)
    }

    fn delete_jobs(&self, status: Option<JobStatus>) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = match status {
            Some(status) => conn.execute("DELETE FROM jobs WHERE status = ?1", [status.as_str()])?,
            None => conn.execute("DELETE FROM jobs", [])?,
        };
        Ok(deleted)
    }

    // === Statistics ===

    fn get_stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let mut stats = QueueStats::default();

        {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (status, count) in rows {
                stats.total += count;
                if let Some(status) = JobStatus::parse(&status) {
                    stats.by_status.set(status, count);
                }
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT type, COUNT(*),
                        SUM(status = 'pending'), SUM(status = 'processing'),
                        SUM(status = 'done'), SUM(status = 'failed')
                 FROM jobs GROUP BY type ORDER BY type ASC",
            )?;
            stats.by_type = stmt
                .query_map([], |row| {
                    Ok(TypeStats {
                        job_type: row.get(0)?,
                        total: row.get(1)?,
                        pending: row.get(2)?,
                        processing: row.get(3)?,
                        done: row.get(4)?,
                        failed: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }

        {
            let mut stmt = conn.prepare(&format!(
                "SELECT priority, COUNT(*) FROM jobs WHERE {}
                 GROUP BY priority ORDER BY priority DESC",
                status_in(&[
                    JobStatus::Pending,
                    JobStatus::Scheduled,
                    JobStatus::Delayed,
                    JobStatus::Processing,
                ])
            ))?;
            stats.by_priority = stmt
                .query_map([], |row| {
                    Ok(PriorityStats {
                        priority: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }

        stats.avg_processing_secs = conn.query_row(
            "SELECT AVG(completed_at - started_at) FROM jobs
             WHERE status = 'done' AND started_at IS NOT NULL AND completed_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        stats.avg_wait_secs = conn.query_row(
            "SELECT AVG(started_at - created_at) FROM jobs WHERE started_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        stats.oldest_pending_at = conn.query_row(
            "SELECT MIN(created_at) FROM jobs WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        stats.next_scheduled_at = conn.query_row(
            "SELECT MIN(scheduled_at) FROM jobs WHERE status IN ('scheduled', 'delayed')",
            [],
            |row| row.get(0),
        )?;

        Ok(stats)
    }

    // === Leases ===

    fn try_acquire_lease(&self, name: &str, holder: &str, ttl_secs: i64) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "INSERT INTO queue_locks (name, holder, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                     holder = excluded.holder,
                     acquired_at = excluded.acquired_at,
                     expires_at = excluded.expires_at
                 WHERE queue_locks.expires_at <= ?3",
                params![name, holder, now, now + ttl_secs],
            )
            .with_context(|| format!("Failed to acquire lease {}", name))?;
        Ok(changed == 1)
    }

    fn renew_lease(&self, name: &str, holder: &str, ttl_secs: i64) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE queue_locks SET expires_at = ?3
             WHERE name = ?1 AND holder = ?2 AND expires_at > ?4",
            params![name, holder, now + ttl_secs, now],
        )?;
        Ok(changed == 1)
    }

    fn release_lease(&self, name: &str, holder: Option<&str>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = match holder {
            Some(holder) => conn.execute(
                "DELETE FROM queue_locks WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )?,
            None => conn.execute("DELETE FROM queue_locks WHERE name = ?1", [name])?,
        };
        Ok(changed == 1)
    }

    fn get_lease(&self, name: &str) -> Result<Option<Lease>> {
        let conn = self.conn()?;
        let lease = conn
            .query_row(
                "SELECT name, holder, acquired_at, expires_at FROM queue_locks WHERE name = ?1",
                [name],
                |row| {
                    Ok(Lease {
                        name: row.get(0)?,
                        holder: row.get(1)?,
                        acquired_at: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }
}

const RETRY_ASSIGNMENTS: &str = "status = 'pending', attempts = 0, error_message = NULL,
     result = NULL, scheduled_at = NULL, started_at = NULL, completed_at = NULL";

/// Row counts above `i64::MAX` mean "no bound" to SQLite.
fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
