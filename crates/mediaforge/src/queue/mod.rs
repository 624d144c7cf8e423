//! Per-kind durable job queue.
//!
//! A queue is a FIFO view over `conversion_jobs` rows of one kind. Enqueue
//! is idempotent per `(subject_file_id, kind)` while a job is active, and
//! claiming is a single conditional update so two workers never share a job.

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;

use crate::broadcast::LiveProgress;
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::Database;
use crate::error::QueueError;
use crate::job::{ConversionJob, JobHandle, JobKind, JobPayload, JobStatus, JobStatusView};
use crate::storage::{is_usable_artifact, StorageLayout};

/// What a caller gets back when asking for a derivative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DerivativeOutcome {
    /// The artifact exists; no job was involved.
    Ready { path: PathBuf },
    /// A conversion is queued or running.
    Pending { job: JobStatusView },
    /// The latest conversion failed and nothing is active.
    Failed { job_id: String, error: String },
}

#[derive(Clone)]
pub struct ConversionQueue {
    kind: JobKind,
    db: Database,
    layout: StorageLayout,
    live: LiveProgress,
}

impl ConversionQueue {
    pub fn new(kind: JobKind, db: Database, layout: StorageLayout, live: LiveProgress) -> Self {
        Self {
            kind,
            db,
            layout,
            live,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Queues a conversion unless one is already active for the subject, in
    /// which case the active job's handle is returned unchanged.
    ///
    /// Any backend failure is reported as [`QueueError::ServiceUnavailable`]:
    /// no job exists and the caller should try again later.
    pub fn enqueue(
        &self,
        subject_file_id: &str,
        owner_id: &str,
        payload: JobPayload,
    ) -> Result<JobHandle, QueueError> {
        self.layout
            .final_path(self.kind, owner_id, subject_file_id)
            .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;

        let unavailable = |e: crate::db::DatabaseError| {
            log::error!("Failed to enqueue {} job: {}", self.kind, e);
            QueueError::ServiceUnavailable(e.to_string())
        };

        let row = JobRow::new_queued(subject_file_id, self.kind, owner_id, &payload, Utc::now())
            .map_err(unavailable)?;
        let (row, created) = job_repo::insert_if_no_active(&self.db, &row).map_err(unavailable)?;
        let job = row.into_job().map_err(unavailable)?;

        if created {
            log::info!(
                "Queued {} job {} for file {}",
                self.kind,
                job.id,
                subject_file_id
            );
        } else {
            log::debug!(
                "File {} already has active {} job {}",
                subject_file_id,
                self.kind,
                job.id
            );
        }

        Ok(JobHandle::for_job(&job, created))
    }

    /// Status of the most recent job for the subject.
    ///
    /// A completed job whose artifact has disappeared reads as `None` so the
    /// caller treats it as a cache miss and may enqueue again.
    pub fn status_of(&self, subject_file_id: &str) -> Result<Option<JobStatusView>, QueueError> {
        let Some(row) = job_repo::find_latest(&self.db, subject_file_id, self.kind)? else {
            return Ok(None);
        };
        let job = row.into_job()?;

        if job.status == JobStatus::Completed && !has_artifact(&job) {
            log::warn!(
                "Completed {} job {} has no artifact on disk; treating as cache miss",
                self.kind,
                job.id
            );
            return Ok(None);
        }

        let mut view = JobStatusView::from(&job);
        if job.status == JobStatus::Processing {
            if let Some(live) = self.live.get(&job.id) {
                view.progress = view.progress.max(live);
            }
        }
        Ok(Some(view))
    }

    pub fn job(&self, job_id: &str) -> Result<Option<ConversionJob>, QueueError> {
        match job_repo::find_by_id(&self.db, job_id)? {
            Some(row) if row.kind == self.kind.as_str() => Ok(Some(row.into_job()?)),
            _ => Ok(None),
        }
    }

    /// Atomically moves the oldest queued job to `processing`.
    pub fn claim_next(&self) -> Result<Option<ConversionJob>, QueueError> {
        match job_repo::claim_next(&self.db, self.kind, Utc::now())? {
            Some(row) => Ok(Some(row.into_job()?)),
            None => Ok(None),
        }
    }

    /// Cache-first read path: true when the final artifact is present.
    pub fn has_cached_output(&self, subject_file_id: &str, owner_id: &str) -> bool {
        self.layout
            .cached_artifact(self.kind, owner_id, subject_file_id)
            .is_some()
    }

    /// Final artifact location for the subject, whether or not it exists yet.
    pub fn output_path_for(
        &self,
        subject_file_id: &str,
        owner_id: &str,
    ) -> Result<PathBuf, QueueError> {
        self.layout
            .final_path(self.kind, owner_id, subject_file_id)
            .map_err(|e| QueueError::InvalidRequest(e.to_string()))
    }

    /// Serves the cached artifact, reports the active or failed job, or
    /// queues a new conversion.
    pub fn request(
        &self,
        subject_file_id: &str,
        owner_id: &str,
        payload: JobPayload,
    ) -> Result<DerivativeOutcome, QueueError> {
        if let Some(path) = self
            .layout
            .cached_artifact(self.kind, owner_id, subject_file_id)
        {
            return Ok(DerivativeOutcome::Ready { path });
        }

        if let Some(view) = self.status_of(subject_file_id)? {
            match view.status {
                JobStatus::Queued | JobStatus::Processing => {
                    return Ok(DerivativeOutcome::Pending { job: view });
                }
                JobStatus::Failed => {
                    return Ok(DerivativeOutcome::Failed {
                        job_id: view.job_id,
                        error: view.error.unwrap_or_default(),
                    });
                }
                JobStatus::Completed | JobStatus::Cancelled => {}
            }
        }

        let handle = self.enqueue(subject_file_id, owner_id, payload)?;
        Ok(DerivativeOutcome::Pending {
            job: JobStatusView {
                job_id: handle.job_id,
                status: handle.status,
                progress: 0,
                error: None,
                output_path: None,
            },
        })
    }

    /// Lists jobs of this kind, newest first.
    pub fn list(&self, mut filter: JobFilter) -> Result<(Vec<ConversionJob>, u64), QueueError> {
        filter.kind = Some(self.kind);
        let (rows, total) = job_repo::query(&self.db, &filter)?;
        let jobs = rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }
}

fn has_artifact(job: &ConversionJob) -> bool {
    job.output_path
        .as_deref()
        .map(is_usable_artifact)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ensure_directory;
    use tempfile::TempDir;

    fn queue(kind: JobKind) -> (ConversionQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let queue = ConversionQueue::new(
            kind,
            db,
            StorageLayout::new(dir.path()),
            LiveProgress::new(),
        );
        (queue, dir)
    }

    fn payload() -> JobPayload {
        JobPayload::new("/srv/files/report.docx")
    }

    #[test]
    fn test_enqueue_dedups_active_job() {
        let (queue, _dir) = queue(JobKind::DocumentPreview);
        let first = queue.enqueue("f1", "u1", payload()).unwrap();
        let second = queue.enqueue("f1", "u1", payload()).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.status, JobStatus::Queued);

        let (_, total) = queue.list(JobFilter::default()).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_enqueue_rejects_bad_identifiers() {
        let (queue, _dir) = queue(JobKind::Thumbnail);
        assert!(matches!(
            queue.enqueue("../escape", "u1", payload()),
            Err(QueueError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_claim_then_status_overlays_live_progress() {
        let (queue, _dir) = queue(JobKind::Transcode);
        let handle = queue
            .enqueue("f1", "u1", JobPayload::new("/in/a.mov"))
            .unwrap();

        let claimed = queue.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, handle.job_id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(queue.claim_next().unwrap().is_none());

        queue.live.set(&claimed.id, 37);
        let view = queue.status_of("f1").unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Processing);
        assert_eq!(view.progress, 37);
    }

    #[test]
    fn test_completed_without_artifact_is_cache_miss() {
        let (queue, dir) = queue(JobKind::Thumbnail);
        let handle = queue.enqueue("f1", "u1", payload()).unwrap();
        queue.claim_next().unwrap();

        let missing = dir.path().join("gone.png");
        job_repo::mark_completed(
            &queue.db,
            &handle.job_id,
            1,
            &missing.to_string_lossy(),
            Utc::now(),
        )
        .unwrap();
        assert!(queue.status_of("f1").unwrap().is_none());

        // Re-enqueue is allowed and creates a fresh job.
        let again = queue.enqueue("f1", "u1", payload()).unwrap();
        assert!(again.created);
        assert_ne!(again.job_id, handle.job_id);
    }

    #[test]
    fn test_request_cache_first() {
        let (queue, _dir) = queue(JobKind::DocumentPreview);
        let path = queue.output_path_for("f1", "u1").unwrap();
        ensure_directory(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"%PDF").unwrap();

        assert!(queue.has_cached_output("f1", "u1"));
        assert!(!queue.has_cached_output("f1", "u2"));
        assert_eq!(
            queue.request("f1", "u1", payload()).unwrap(),
            DerivativeOutcome::Ready { path }
        );
        let (_, total) = queue.list(JobFilter::default()).unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn test_request_pending_then_failed() {
        let (queue, _dir) = queue(JobKind::DocumentPreview);
        let first = match queue.request("f1", "u1", payload()).unwrap() {
            DerivativeOutcome::Pending { job } => job,
            other => panic!("Expected pending, got {:?}", other),
        };
        let second = match queue.request("f1", "u1", payload()).unwrap() {
            DerivativeOutcome::Pending { job } => job,
            other => panic!("Expected pending, got {:?}", other),
        };
        assert_eq!(first.job_id, second.job_id);

        queue.claim_next().unwrap();
        job_repo::mark_failed(&queue.db, &first.job_id, 1, "soffice exited with code 1", Utc::now())
            .unwrap();

        assert_eq!(
            queue.request("f1", "u1", payload()).unwrap(),
            DerivativeOutcome::Failed {
                job_id: first.job_id.clone(),
                error: "soffice exited with code 1".to_string(),
            }
        );
    }

    #[test]
    fn test_job_lookup_scoped_to_kind() {
        let (queue, _dir) = queue(JobKind::Transcode);
        let handle = queue
            .enqueue("f1", "u1", JobPayload::new("/in/a.mov"))
            .unwrap();
        assert!(queue.job(&handle.job_id).unwrap().is_some());

        let other = ConversionQueue::new(
            JobKind::Thumbnail,
            queue.db.clone(),
            queue.layout.clone(),
            LiveProgress::new(),
        );
        assert!(other.job(&handle.job_id).unwrap().is_none());
    }
}
