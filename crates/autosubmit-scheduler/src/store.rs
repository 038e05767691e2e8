use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    db::{fmt_ts, init_db, is_storable, parse_ts, truncate_ts},
    error::{Result, SchedulerError},
    types::{Job, JobStatus, StatusCounts, Transition},
};

/// Longest `target` accepted from an owner.
pub const MAX_TARGET_BYTES: usize = 2048;

const JOB_COLUMNS: &str = "id, owner, target, not_before, status, claim_token, claim_deadline,
                           attempt_count, last_error, created_at, updated_at";

/// Durable job table.
///
/// Each instance wraps its own connection; workers and the owner API open
/// separate stores against the same database file and coordinate only
/// through the conditional updates below, never through in-process locks.
///
/// Two surfaces:
/// - [`JobStore::for_owner`]: owner-scoped create / read / delete.
/// - the remaining methods: privileged, cross-owner, used by the claim
///   engine, dispatcher and reconciler.
pub struct JobStore {
    db: Mutex<Connection>,
}

impl JobStore {
    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open `path` in WAL mode with `busy_timeout` as the per-call store timeout.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    /// Private in-memory store; handy for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied row
        // behind (every write is a single statement), so poisoning is ignored.
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Owner-scoped view. Every query issued through it filters on `owner`.
    pub fn for_owner<'a>(&'a self, owner: &'a str) -> OwnerJobs<'a> {
        OwnerJobs { store: self, owner }
    }

    // --- system scope ------------------------------------------------------

    /// Pending jobs with `not_before <= now`, oldest-due first.
    #[instrument(skip(self), fields(now = %now, limit))]
    pub fn list_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'pending' AND not_before <= ?1
             ORDER BY not_before ASC, id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![fmt_ts(now), limit], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Claimed jobs whose lease ran out strictly before `now`.
    #[instrument(skip(self), fields(now = %now))]
    pub fn list_expired_claims(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'claimed' AND claim_deadline < ?1
             ORDER BY claim_deadline ASC"
        ))?;
        let rows = stmt.query_map([fmt_ts(now)], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Conditionally move `id` from `pending` to `claimed`.
    ///
    /// Succeeds only if the row is still pending, due at `now`, and has
    /// attempts left. Returns the claimed row, or `None` when another worker
    /// (or the owner) got there first.
    #[instrument(skip(self, token), fields(job_id = %id))]
    pub fn try_claim(
        &self,
        id: &str,
        token: &str,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Option<Job>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "UPDATE jobs
             SET status = 'claimed', claim_token = ?2, claim_deadline = ?3,
                 attempt_count = attempt_count + 1, updated_at = ?4
             WHERE id = ?1 AND status = 'pending' AND not_before <= ?4
               AND attempt_count < ?5
             RETURNING {JOB_COLUMNS}"
        ))?;
        let job = stmt
            .query_row(
                rusqlite::params![id, token, fmt_ts(deadline), fmt_ts(now), max_attempts],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Fail a pending job that can no longer be claimed because it has used
    /// up its attempts (e.g. `max_attempts` was lowered between restarts).
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn fail_exhausted(
        &self,
        id: &str,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Transition> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE jobs
             SET status = 'failed', last_error = COALESCE(last_error, 'retry limit reached'),
                 updated_at = ?2
             WHERE id = ?1 AND status = 'pending' AND attempt_count >= ?3",
            rusqlite::params![id, fmt_ts(now), max_attempts],
        )?;
        if n == 1 {
            return Ok(Transition::Applied(JobStatus::Failed));
        }
        classify_miss(&db, id)
    }

    /// `claimed → completed`, only while `token` still holds the claim.
    #[instrument(skip(self, token), fields(job_id = %id))]
    pub fn complete(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<Transition> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE jobs
             SET status = 'completed', claim_token = NULL, claim_deadline = NULL,
                 updated_at = ?3
             WHERE id = ?1 AND status = 'claimed' AND claim_token = ?2",
            rusqlite::params![id, token, fmt_ts(now)],
        )?;
        if n == 1 {
            return Ok(Transition::Applied(JobStatus::Completed));
        }
        classify_miss(&db, id)
    }

    /// Confirm `token` still holds the claim on `id` and will keep holding it
    /// past `until`. Read-only; the dispatcher checks this before calling out.
    #[instrument(skip(self, token), fields(job_id = %id))]
    pub fn check_claim(&self, id: &str, token: &str, until: DateTime<Utc>) -> Result<Transition> {
        let db = self.conn();
        let held = db
            .query_row(
                "SELECT 1 FROM jobs
                 WHERE id = ?1 AND status = 'claimed' AND claim_token = ?2
                   AND claim_deadline > ?3",
                rusqlite::params![id, token, fmt_ts(until)],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if held {
            return Ok(Transition::Applied(JobStatus::Claimed));
        }
        classify_miss(&db, id)
    }

    /// Record a failed attempt while `token` still holds the claim.
    ///
    /// The job goes back to `pending` (eligible again at `retry_at`) if it has
    /// attempts left, otherwise to `failed`. `error` is stored either way.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, token, error), fields(job_id = %id))]
    pub fn record_failure(
        &self,
        id: &str,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Transition> {
        let db = self.conn();
        let status: Option<String> = db
            .query_row(
                "UPDATE jobs
                 SET status = CASE WHEN attempt_count >= ?5 THEN 'failed' ELSE 'pending' END,
                     not_before = CASE WHEN attempt_count >= ?5 THEN not_before ELSE ?4 END,
                     claim_token = NULL, claim_deadline = NULL,
                     last_error = ?6, updated_at = ?3
                 WHERE id = ?1 AND status = 'claimed' AND claim_token = ?2
                 RETURNING status",
                rusqlite::params![id, token, fmt_ts(now), fmt_ts(retry_at), max_attempts, error],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => Ok(Transition::Applied(parse_status(&s)?)),
            None => classify_miss(&db, id),
        }
    }

    /// Take back an expired claim.
    ///
    /// Matches only if the claim is still the one the caller observed (same
    /// token and deadline) and its lease is over at `now`, so a dispatcher
    /// that finishes between the read and this write wins. `attempt_count` is
    /// kept: an expired lease counts as a failed attempt.
    #[instrument(skip(self, token), fields(job_id = %id))]
    pub fn reclaim(
        &self,
        id: &str,
        token: &str,
        observed_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Transition> {
        let db = self.conn();
        let status: Option<String> = db
            .query_row(
                "UPDATE jobs
                 SET status = CASE WHEN attempt_count >= ?5 THEN 'failed' ELSE 'pending' END,
                     claim_token = NULL, claim_deadline = NULL,
                     last_error = 'lease expired', updated_at = ?4
                 WHERE id = ?1 AND status = 'claimed' AND claim_token = ?2
                   AND claim_deadline = ?3 AND claim_deadline < ?4
                 RETURNING status",
                rusqlite::params![
                    id,
                    token,
                    fmt_ts(observed_deadline),
                    fmt_ts(now),
                    max_attempts
                ],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => Ok(Transition::Applied(parse_status(&s)?)),
            None => classify_miss(&db, id),
        }
    }

    /// Fetch any job regardless of owner.
    pub fn get_any(&self, id: &str) -> Result<Option<Job>> {
        let db = self.conn();
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let n: i64 = row.get(1)?;
            let n = n.max(0) as u64;
            match parse_status(&status)? {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Claimed => counts.claimed = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

/// Owner-scoped access to the job table.
///
/// A job belonging to someone else is indistinguishable from a missing one.
pub struct OwnerJobs<'a> {
    store: &'a JobStore,
    owner: &'a str,
}

impl OwnerJobs<'_> {
    /// Schedule a new job in `pending`.
    #[instrument(skip(self, target), fields(owner = %self.owner, not_before = %not_before))]
    pub fn create(&self, target: &str, not_before: DateTime<Utc>) -> Result<Job> {
        validate_owner(self.owner)?;
        let target = target.trim();
        if target.is_empty() {
            return Err(SchedulerError::InvalidJob("target must not be empty".to_string()));
        }
        if target.len() > MAX_TARGET_BYTES {
            return Err(SchedulerError::InvalidJob(format!(
                "target exceeds {MAX_TARGET_BYTES} bytes"
            )));
        }

        if !is_storable(not_before) {
            return Err(SchedulerError::InvalidJob(
                "not_before must fall within years 0000-9999".to_string(),
            ));
        }

        let now = truncate_ts(Utc::now());
        let not_before = truncate_ts(not_before);
        let id = Uuid::now_v7().to_string();

        let db = self.store.conn();
        db.execute(
            "INSERT INTO jobs
             (id, owner, target, not_before, status, claim_token, claim_deadline,
              attempt_count, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', NULL, NULL, 0, NULL, ?5, ?5)",
            rusqlite::params![id, self.owner, target, fmt_ts(not_before), fmt_ts(now)],
        )?;
        info!(job_id = %id, owner = %self.owner, "job scheduled");

        Ok(Job {
            id,
            owner: self.owner.to_string(),
            target: target.to_string(),
            not_before,
            status: JobStatus::Pending,
            claim_token: None,
            claim_deadline: None,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let db = self.store.conn();
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1 AND owner = ?2"),
                rusqlite::params![id, self.owner],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// All of this owner's jobs, newest first.
    pub fn list(&self) -> Result<Vec<Job>> {
        let db = self.store.conn();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE owner = ?1
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([self.owner], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a job in any state. An in-flight dispatch of it becomes a no-op.
    #[instrument(skip(self), fields(owner = %self.owner, job_id = %id))]
    pub fn delete(&self, id: &str) -> Result<()> {
        let db = self.store.conn();
        let n = db.execute(
            "DELETE FROM jobs WHERE id = ?1 AND owner = ?2",
            rusqlite::params![id, self.owner],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, owner = %self.owner, "job deleted");
        Ok(())
    }
}

fn validate_owner(owner: &str) -> Result<()> {
    if owner.trim().is_empty() {
        return Err(SchedulerError::InvalidJob("owner must not be empty".to_string()));
    }
    Ok(())
}

/// Explain why a conditional update touched no row.
fn classify_miss(db: &Connection, id: &str) -> Result<Transition> {
    let exists = db
        .query_row("SELECT 1 FROM jobs WHERE id = ?1", [id], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        debug!(job_id = %id, "conditional update superseded");
        Ok(Transition::Superseded)
    } else {
        debug!(job_id = %id, "conditional update hit a deleted job");
        Ok(Transition::NotFound)
    }
}

fn parse_status(s: &str) -> rusqlite::Result<JobStatus> {
    s.parse::<JobStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into())
    })
}

fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_ts(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

/// Map a row selected with `JOB_COLUMNS` to a `Job`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        owner: row.get(1)?,
        target: row.get(2)?,
        not_before: ts_column(row, 3)?,
        status: parse_status(&status)?,
        claim_token: row.get(5)?,
        claim_deadline: opt_ts_column(row, 6)?,
        attempt_count: row.get(7)?,
        last_error: row.get(8)?,
        created_at: ts_column(row, 9)?,
        updated_at: ts_column(row, 10)?,
    })
}
