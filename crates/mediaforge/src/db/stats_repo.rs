//! Queue statistics repository: aggregate views over `conversion_jobs`.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::job_repo::format_timestamp;
use super::{Database, DatabaseError};
use crate::job::JobKind;

/// Per-kind queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub kind: String,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Processing rows not touched since the stall cutoff.
    pub stalled: u64,
    /// Age in seconds of the oldest queued job, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_queued_secs: Option<i64>,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Returns the counters for one kind.
///
/// `stale_cutoff` decides which processing rows count as stall candidates.
pub fn queue_stats(
    db: &Database,
    kind: JobKind,
    stale_cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<QueueStats, DatabaseError> {
    db.with_conn(|conn| {
        let mut stats = QueueStats {
            kind: kind.as_str().to_string(),
            ..Default::default()
        };

        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM conversion_jobs WHERE kind = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "queued" => stats.queued = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                other => log::warn!("Ignoring unknown job status '{}' in stats", other),
            }
        }

        stats.stalled = conn.query_row(
            "SELECT COUNT(*) FROM conversion_jobs
             WHERE kind = ?1 AND status = 'processing' AND updated_at < ?2",
            params![kind.as_str(), format_timestamp(stale_cutoff)],
            |r| r.get(0),
        )?;

        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(created_at) FROM conversion_jobs WHERE kind = ?1 AND status = 'queued'",
            params![kind.as_str()],
            |r| r.get(0),
        )?;
        stats.oldest_queued_secs = oldest
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| (now - dt.with_timezone(&Utc)).num_seconds().max(0));

        Ok(stats)
    })
}
