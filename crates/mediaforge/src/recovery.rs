//! Administrative state transitions over the job store.
//!
//! Every operation runs across all three kinds and touches only the rows its
//! status predicate names, so it is safe to run while workers are live.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::job_repo::{self, StallSweep};
use crate::db::stats_repo::{self, QueueStats};
use crate::db::{Database, DatabaseError};
use crate::job::JobKind;

#[derive(Clone)]
pub struct RecoveryOps {
    db: Database,
    max_attempts: u32,
}

impl RecoveryOps {
    pub fn new(db: Database, max_attempts: u32) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Moves every failed job back to `queued` with its error cleared.
    ///
    /// A failed job whose subject already has an active job stays failed.
    pub fn retry_all_failed(&self) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        let mut total = 0;
        for kind in JobKind::ALL {
            let n = job_repo::requeue_failed(&self.db, kind, now)?;
            if n > 0 {
                log::info!("Requeued {} failed {} jobs", n, kind);
            }
            total += n;
        }
        Ok(total)
    }

    /// Resets `processing` jobs whose last update is older than `stale_after`.
    pub fn clear_stalled_jobs(&self, stale_after: Duration) -> Result<StallSweep, DatabaseError> {
        let now = Utc::now();
        let cutoff = cutoff_before(now, stale_after);
        let mut sweep = StallSweep::default();
        for kind in JobKind::ALL {
            let s = job_repo::requeue_stalled(&self.db, kind, cutoff, self.max_attempts, now)?;
            if s.total() > 0 {
                log::warn!(
                    "Cleared stalled {} jobs: {} requeued, {} failed after {} attempts",
                    kind,
                    s.requeued,
                    s.failed,
                    self.max_attempts
                );
            }
            sweep.requeued += s.requeued;
            sweep.failed += s.failed;
        }
        Ok(sweep)
    }

    /// Deletes terminal jobs older than `retention_days`. Artifacts are kept.
    pub fn cleanup_old_jobs(&self, retention_days: u32) -> Result<usize, DatabaseError> {
        let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
        let cutoff = cutoff_before(Utc::now(), retention);
        let mut total = 0;
        for kind in JobKind::ALL {
            total += job_repo::delete_terminal_before(&self.db, kind, cutoff)?;
        }
        if total > 0 {
            log::info!(
                "Deleted {} finished jobs older than {} days",
                total,
                retention_days
            );
        }
        Ok(total)
    }

    pub fn cleanup_all_failed_jobs(&self) -> Result<usize, DatabaseError> {
        let mut total = 0;
        for kind in JobKind::ALL {
            total += job_repo::delete_failed(&self.db, kind)?;
        }
        log::info!("Deleted {} failed jobs", total);
        Ok(total)
    }

    /// Cancels every queued job. Running jobs finish normally.
    pub fn cancel_pending_jobs(&self) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        let mut total = 0;
        for kind in JobKind::ALL {
            total += job_repo::cancel_queued(&self.db, kind, now)?;
        }
        log::info!("Cancelled {} pending jobs", total);
        Ok(total)
    }

    /// Per-kind counters; `stale_after` decides what counts as stalled.
    pub fn detailed_queue_stats(
        &self,
        stale_after: Duration,
    ) -> Result<Vec<QueueStats>, DatabaseError> {
        let now = Utc::now();
        let cutoff = cutoff_before(now, stale_after);
        JobKind::ALL
            .into_iter()
            .map(|kind| stats_repo::queue_stats(&self.db, kind, cutoff, now))
            .collect()
    }
}

/// `now - age`, saturating at the earliest representable instant.
fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
