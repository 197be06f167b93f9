//! The durable job queue behind the worker loop.
//!
//! Every transition is guarded in SQL by the status it expects, so a stale
//! caller can never move a job backwards out of a terminal state.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{format_timestamp, now_timestamp, Database, DatabaseError};
use crate::worker::error::JobStoreError;
use crate::worker::job::{Job, JobStatus, NewJob};

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tenant_id: Option<i64>,
    pub submitter_id: Option<i64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a pending job and returns its id.
pub fn enqueue(db: &Database, job: &NewJob, max_attempts: u32) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (tenant_id, submitter_id, attachment_ref, attachment_kind,
             mime_type, file_ext, correlation_id, status, attempts, max_attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, ?9)",
            params![
                job.tenant_id,
                job.submitter_id,
                job.attachment_ref,
                job.attachment_kind,
                job.mime_type,
                job.file_ext,
                job.correlation_id,
                max_attempts,
                now_timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Claims up to `limit` eligible pending jobs in FIFO order and marks them
/// `processing`.
///
/// Selection and marking run in one transaction while the connection lock is
/// held, so two polls in the same process can never claim the same job.
pub fn claim_batch(
    db: &Database,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<Job>, DatabaseError> {
    let now = format_timestamp(now);
    db.with_tx(|tx| {
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE status = 'pending'
                   AND attempts < max_attempts
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, limit as i64], |r| r.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                "UPDATE jobs SET status = 'processing', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now],
            )?;
            claimed.push(tx.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], Job::from_row)?);
        }

        Ok(claimed)
    })
}

/// `processing → completed`.
pub fn mark_completed(db: &Database, id: i64) -> Result<(), JobStoreError> {
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE jobs SET status = 'completed', completed_at = ?2, last_error = NULL,
             next_attempt_at = NULL
             WHERE id = ?1 AND status = 'processing'",
            params![id, now_timestamp()],
        )?)
    })?;
    ensure_changed(db, id, changed, JobStatus::Completed)
}

/// `processing → failed`, recording the final attempt count.
pub fn mark_failed(db: &Database, id: i64, attempts: u32, error: &str) -> Result<(), JobStoreError> {
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE jobs SET status = 'failed', attempts = ?2, last_error = ?3, completed_at = ?4,
             next_attempt_at = NULL
             WHERE id = ?1 AND status = 'processing' AND ?2 >= attempts AND ?2 <= max_attempts",
            params![id, attempts, error, now_timestamp()],
        )?)
    })?;
    ensure_changed_with_attempts(db, id, changed, JobStatus::Failed, attempts)
}

/// `processing → pending` for another attempt. The new attempt count must
/// stay below the ceiling; callers fail the job instead once it is reached.
pub fn mark_retry(
    db: &Database,
    id: i64,
    attempts: u32,
    error: &str,
    next_attempt_at: Option<DateTime<Utc>>,
) -> Result<(), JobStoreError> {
    let next = next_attempt_at.map(format_timestamp);
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE jobs SET status = 'pending', attempts = ?2, last_error = ?3, next_attempt_at = ?4,
             started_at = NULL
             WHERE id = ?1 AND status = 'processing' AND ?2 >= attempts AND ?2 < max_attempts",
            params![id, attempts, error, next],
        )?)
    })?;
    ensure_changed_with_attempts(db, id, changed, JobStatus::Pending, attempts)
}

/// Returns jobs stuck in `processing` since `older_than` or earlier to `pending`.
///
/// Only a crash or an aborted cycle leaves a job there. The worker calls this
/// at start-up with the current time and on every cycle with its staleness
/// threshold.
pub fn requeue_stale(db: &Database, older_than: DateTime<Utc>) -> Result<usize, DatabaseError> {
    let cutoff = format_timestamp(older_than);
    db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE jobs SET status = 'pending', started_at = NULL
             WHERE status = 'processing' AND (started_at IS NULL OR started_at <= ?1)",
            params![cutoff],
        )?)
    })
}

/// Hands claimed jobs back to the queue without spending an attempt.
///
/// Rows that already left `processing` are left alone. Returns how many
/// were released.
pub fn release(db: &Database, ids: &[i64]) -> Result<usize, DatabaseError> {
    db.with_tx(|tx| {
        let mut released = 0;
        for id in ids {
            released += tx.execute(
                "UPDATE jobs SET status = 'pending', started_at = NULL
                 WHERE id = ?1 AND status = 'processing'",
                params![id],
            )?;
        }
        Ok(released)
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<Job>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], Job::from_row)
            .optional()?)
    })
}

/// Queries jobs with filters, newest first, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<Job>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status));
        }
        if let Some(tenant_id) = filter.tenant_id {
            conditions.push(format!("tenant_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(tenant_id));
        }
        if let Some(submitter_id) = filter.submitter_id {
            conditions.push(format!("submitter_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(submitter_id));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<Job> = stmt
            .query_map(params_ref.as_slice(), Job::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Counts jobs with the given status, optionally for a single tenant.
pub fn count_by_status(
    db: &Database,
    status: JobStatus,
    tenant_id: Option<i64>,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1 AND (?2 IS NULL OR tenant_id = ?2)",
            params![status, tenant_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueSummary {
    /// Jobs not yet resolved.
    pub fn open(&self) -> u64 {
        self.pending + self.processing
    }
}

/// Counts jobs per status, optionally for a single tenant.
pub fn queue_summary(db: &Database, tenant_id: Option<i64>) -> Result<QueueSummary, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM jobs
             WHERE (?1 IS NULL OR tenant_id = ?1)
             GROUP BY status",
        )?;
        let rows = stmt.query_map(params![tenant_id], |r| {
            Ok((r.get::<_, JobStatus>(0)?, r.get::<_, u64>(1)?))
        })?;

        let mut summary = QueueSummary::default();
        for row in rows {
            let (status, count) = row?;
            match status {
                JobStatus::Pending => summary.pending = count,
                JobStatus::Processing => summary.processing = count,
                JobStatus::Completed => summary.completed = count,
                JobStatus::Failed => summary.failed = count,
            }
        }
        Ok(summary)
    })
}

fn ensure_changed(
    db: &Database,
    id: i64,
    changed: usize,
    to: JobStatus,
) -> Result<(), JobStoreError> {
    if changed == 1 {
        return Ok(());
    }
    match find_by_id(db, id)? {
        None => Err(JobStoreError::NotFound(id)),
        Some(job) => Err(JobStoreError::InvalidTransition {
            id,
            from: job.status,
            to,
        }),
    }
}

fn ensure_changed_with_attempts(
    db: &Database,
    id: i64,
    changed: usize,
    to: JobStatus,
    attempts: u32,
) -> Result<(), JobStoreError> {
    if changed == 1 {
        return Ok(());
    }
    match find_by_id(db, id)? {
        None => Err(JobStoreError::NotFound(id)),
        Some(job) if job.status != JobStatus::Processing => Err(JobStoreError::InvalidTransition {
            id,
            from: job.status,
            to,
        }),
        Some(job) => Err(JobStoreError::InvalidAttemptCount {
            id,
            attempts,
            max: job.max_attempts,
        }),
    }
}
