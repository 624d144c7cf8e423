//! Job repository: all reads and writes against the `conversion_jobs` table.
//!
//! Every state transition is a single conditional statement so that two
//! workers (or a worker and an administrative sweep) can never both win the
//! same row.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};
use crate::job::{ConversionJob, JobKind, JobPayload, JobStatus};

/// Formats a timestamp as fixed-width RFC3339 so string order matches time order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str, id: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt {
            id: id.to_string(),
            reason: format!("bad timestamp '{}': {}", s, e),
        })
}

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub subject_file_id: String,
    pub kind: String,
    pub status: String,
    pub progress_percent: i64,
    pub attempts: i64,
    pub error: Option<String>,
    pub output_path: Option<String>,
    pub owner_id: String,
    pub payload: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            subject_file_id: row.get("subject_file_id")?,
            kind: row.get("kind")?,
            status: row.get("status")?,
            progress_percent: row.get("progress_percent")?,
            attempts: row.get("attempts")?,
            error: row.get("error")?,
            output_path: row.get("output_path")?,
            owner_id: row.get("owner_id")?,
            payload: row.get("payload")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    /// Builds a fresh `queued` row for a new job.
    pub fn new_queued(
        subject_file_id: &str,
        kind: JobKind,
        owner_id: &str,
        payload: &JobPayload,
        now: DateTime<Utc>,
    ) -> Result<Self, DatabaseError> {
        let id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(payload).map_err(|e| DatabaseError::Corrupt {
            id: id.clone(),
            reason: format!("unserializable payload: {}", e),
        })?;
        let now = format_timestamp(now);
        Ok(Self {
            id,
            subject_file_id: subject_file_id.to_string(),
            kind: kind.as_str().to_string(),
            status: JobStatus::Queued.as_str().to_string(),
            progress_percent: 0,
            attempts: 0,
            error: None,
            output_path: None,
            owner_id: owner_id.to_string(),
            payload,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        })
    }

    /// Maps the raw row into the typed job model.
    pub fn into_job(self) -> Result<ConversionJob, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let kind = JobKind::parse(&self.kind)
            .ok_or_else(|| corrupt(format!("unknown kind '{}'", self.kind)))?;
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let payload: JobPayload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("bad payload: {}", e)))?;
        let created_at = parse_timestamp(&self.created_at, &self.id)?;
        let updated_at = parse_timestamp(&self.updated_at, &self.id)?;
        let completed_at = match self.completed_at.as_deref() {
            Some(s) => Some(parse_timestamp(s, &self.id)?),
            None => None,
        };

        Ok(ConversionJob {
            progress_percent: self.progress_percent.clamp(0, 100) as u8,
            attempts: self.attempts.max(0) as u32,
            error: self.error,
            output_path: self.output_path.map(PathBuf::from),
            id: self.id,
            subject_file_id: self.subject_file_id,
            kind,
            status,
            owner_id: self.owner_id,
            payload,
            created_at,
            updated_at,
            completed_at,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub subject_file_id: Option<String>,
    pub owner_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts `row` unless an active (queued/processing) job already exists for
/// the same `(subject_file_id, kind)`.
///
/// Returns the row that is active afterwards and whether it was newly created.
pub fn insert_if_no_active(db: &Database, row: &JobRow) -> Result<(JobRow, bool), DatabaseError> {
    db.with_conn(|conn| {
        // The partial unique index turns a duplicate into a no-op insert; the
        // follow-up read runs in the same transaction so it sees the winner.
        for _ in 0..3 {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT INTO conversion_jobs (id, subject_file_id, kind, status, progress_percent,
                 attempts, error, output_path, owner_id, payload, created_at, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT DO NOTHING",
                params![
                    row.id,
                    row.subject_file_id,
                    row.kind,
                    row.status,
                    row.progress_percent,
                    row.attempts,
                    row.error,
                    row.output_path,
                    row.owner_id,
                    row.payload,
                    row.created_at,
                    row.updated_at,
                    row.completed_at,
                ],
            )?;

            if inserted == 1 {
                tx.commit()?;
                return Ok((row.clone(), true));
            }

            let existing = tx
                .query_row(
                    "SELECT * FROM conversion_jobs
                     WHERE subject_file_id = ?1 AND kind = ?2
                       AND status IN ('queued', 'processing')",
                    params![row.subject_file_id, row.kind],
                    JobRow::from_row,
                )
                .optional()?;
            tx.commit()?;

            if let Some(existing) = existing {
                return Ok((existing, false));
            }
            // The conflicting job finished between the two statements; retry.
        }

        Err(DatabaseError::Corrupt {
            id: row.id.clone(),
            reason: "insert kept conflicting without a visible active job".to_string(),
        })
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM conversion_jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Returns the most recently created job for a subject and kind.
pub fn find_latest(
    db: &Database,
    subject_file_id: &str,
    kind: JobKind,
) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM conversion_jobs
                 WHERE subject_file_id = ?1 AND kind = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![subject_file_id, kind.as_str()],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Atomically moves the oldest queued job of `kind` to `processing` and
/// increments its attempt counter.
pub fn claim_next(
    db: &Database,
    kind: JobKind,
    now: DateTime<Utc>,
) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "UPDATE conversion_jobs
                 SET status = 'processing', attempts = attempts + 1, updated_at = ?2
                 WHERE id = (
                     SELECT id FROM conversion_jobs
                     WHERE kind = ?1 AND status = 'queued'
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT 1
                 )
                 AND status = 'queued'
                 RETURNING *",
                params![kind.as_str(), format_timestamp(now)],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Persists a progress value. Only applies while the claim identified by
/// `attempt` still owns the job and never lowers the stored value. Returns
/// whether a row was written.
pub fn update_progress(
    db: &Database,
    id: &str,
    attempt: u32,
    progress: u8,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE conversion_jobs SET progress_percent = ?3, updated_at = ?4
             WHERE id = ?1 AND attempts = ?2 AND status = 'processing'
               AND progress_percent <= ?3",
            params![id, attempt, progress.min(100), format_timestamp(now)],
        )?;
        Ok(changed == 1)
    })
}

/// Finalizes a processing job as completed. Returns false if the claim made
/// at `attempt` no longer owns the job (reset by a stall sweep, possibly
/// re-claimed since).
pub fn mark_completed(
    db: &Database,
    id: &str,
    attempt: u32,
    output_path: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let now = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE conversion_jobs
             SET status = 'completed', progress_percent = 100, output_path = ?3,
                 error = NULL, updated_at = ?4, completed_at = ?4
             WHERE id = ?1 AND attempts = ?2 AND status = 'processing'",
            params![id, attempt, output_path, now],
        )?;
        Ok(changed == 1)
    })
}

/// Finalizes a processing job as failed. Same ownership rule as `mark_completed`.
pub fn mark_failed(
    db: &Database,
    id: &str,
    attempt: u32,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let now = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE conversion_jobs
             SET status = 'failed', error = ?3, output_path = NULL,
                 updated_at = ?4, completed_at = ?4
             WHERE id = ?1 AND attempts = ?2 AND status = 'processing'",
            params![id, attempt, error, now],
        )?;
        Ok(changed == 1)
    })
}

/// Moves every failed job of `kind` back to queued.
///
/// A failed row whose subject already has an active job is skipped
/// (`OR IGNORE` on the partial unique index) and stays failed.
pub fn requeue_failed(
    db: &Database,
    kind: JobKind,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE OR IGNORE conversion_jobs
             SET status = 'queued', error = NULL, progress_percent = 0,
                 completed_at = NULL, updated_at = ?2
             WHERE kind = ?1 AND status = 'failed'",
            params![kind.as_str(), format_timestamp(now)],
        )?;
        Ok(changed)
    })
}

/// Outcome of a stall sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallSweep {
    pub requeued: usize,
    pub failed: usize,
}

impl StallSweep {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Resets processing jobs not updated since `cutoff`. Jobs that already used
/// `max_attempts` are failed instead of requeued.
pub fn requeue_stalled(
    db: &Database,
    kind: JobKind,
    cutoff: DateTime<Utc>,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<StallSweep, DatabaseError> {
    let cutoff = format_timestamp(cutoff);
    let now = format_timestamp(now);
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let failed = tx.execute(
            "UPDATE conversion_jobs
             SET status = 'failed', error = 'Stalled after ' || attempts || ' attempts',
                 updated_at = ?3, completed_at = ?3
             WHERE kind = ?1 AND status = 'processing' AND updated_at < ?2
               AND attempts >= ?4",
            params![kind.as_str(), cutoff, now, max_attempts],
        )?;
        let requeued = tx.execute(
            "UPDATE conversion_jobs
             SET status = 'queued', progress_percent = 0, updated_at = ?3
             WHERE kind = ?1 AND status = 'processing' AND updated_at < ?2
               AND attempts < ?4",
            params![kind.as_str(), cutoff, now, max_attempts],
        )?;
        tx.commit()?;
        Ok(StallSweep { requeued, failed })
    })
}

/// Deletes terminal jobs of `kind` last touched before `cutoff`.
pub fn delete_terminal_before(
    db: &Database,
    kind: JobKind,
    cutoff: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM conversion_jobs
             WHERE kind = ?1 AND status IN ('completed', 'failed', 'cancelled')
               AND updated_at < ?2",
            params![kind.as_str(), format_timestamp(cutoff)],
        )?;
        Ok(deleted)
    })
}

/// Deletes every failed job of `kind`, regardless of age.
pub fn delete_failed(db: &Database, kind: JobKind) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM conversion_jobs WHERE kind = ?1 AND status = 'failed'",
            params![kind.as_str()],
        )?;
        Ok(deleted)
    })
}

/// Cancels every queued job of `kind`. Processing rows are never touched.
pub fn cancel_queued(
    db: &Database,
    kind: JobKind,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let now = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE conversion_jobs
             SET status = 'cancelled', updated_at = ?2, completed_at = ?2
             WHERE kind = ?1 AND status = 'queued'",
            params![kind.as_str(), now],
        )?;
        Ok(changed)
    })
}

/// Counts jobs of `kind` with the given status.
pub fn count_by_status(
    db: &Database,
    kind: JobKind,
    status: JobStatus,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM conversion_jobs WHERE kind = ?1 AND status = ?2",
            params![kind.as_str(), status.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Queries jobs with filters, newest first, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(kind) = filter.kind {
            conditions.push(format!("kind = ?{}", param_values.len() + 1));
            param_values.push(Box::new(kind.as_str()));
        }
        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str()));
        }
        if let Some(ref subject) = filter.subject_file_id {
            conditions.push(format!("subject_file_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(subject.clone()));
        }
        if let Some(ref owner) = filter.owner_id {
            conditions.push(format!("owner_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(owner.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM conversion_jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM conversion_jobs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}
