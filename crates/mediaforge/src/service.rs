//! Entry point for request handlers and the worker process.
//!
//! [`ConversionService`] owns one queue per kind plus the shared database,
//! storage layout and progress channels. Request handlers use the
//! enqueue/status/cache surface; the worker binary calls
//! [`ConversionService::start_workers`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::broadcast::{JobProgressEvent, LiveProgress, ProgressBroadcaster};
use crate::config::Config;
use crate::db::job_repo::StallSweep;
use crate::db::stats_repo::QueueStats;
use crate::db::{Database, DatabaseError};
use crate::driver::driver_for;
use crate::error::{QueueError, Result};
use crate::job::{JobHandle, JobKind, JobPayload, JobStatusView, TranscodeQuality};
use crate::maintenance::MaintenanceScheduler;
use crate::queue::{ConversionQueue, DerivativeOutcome};
use crate::recovery::RecoveryOps;
use crate::storage::{ensure_directory, StorageLayout};
use crate::worker::{PoolSettings, WorkerPool};

pub struct ConversionService {
    config: Config,
    db: Database,
    layout: StorageLayout,
    live: LiveProgress,
    broadcaster: ProgressBroadcaster,
    transcode: ConversionQueue,
    thumbnail: ConversionQueue,
    document_preview: ConversionQueue,
    recovery: RecoveryOps,
}

impl ConversionService {
    /// Creates the storage root and opens the job database named by `config`.
    pub fn open(config: Config) -> Result<Self> {
        ensure_directory(&config.storage_root)?;
        let db = Database::open(&config.database_path())?;
        Ok(Self::with_database(config, db))
    }

    pub fn with_database(config: Config, db: Database) -> Self {
        let layout = StorageLayout::new(&config.storage_root);
        let live = LiveProgress::new();
        let queue = |kind| ConversionQueue::new(kind, db.clone(), layout.clone(), live.clone());

        Self {
            transcode: queue(JobKind::Transcode),
            thumbnail: queue(JobKind::Thumbnail),
            document_preview: queue(JobKind::DocumentPreview),
            recovery: RecoveryOps::new(db.clone(), config.recovery.max_attempts),
            broadcaster: ProgressBroadcaster::default(),
            config,
            db,
            layout,
            live,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn queue(&self, kind: JobKind) -> &ConversionQueue {
        match kind {
            JobKind::Transcode => &self.transcode,
            JobKind::Thumbnail => &self.thumbnail,
            JobKind::DocumentPreview => &self.document_preview,
        }
    }

    pub fn recovery(&self) -> &RecoveryOps {
        &self.recovery
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.broadcaster
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.broadcaster.subscribe()
    }

    // --- request surface ---

    pub fn enqueue(
        &self,
        kind: JobKind,
        subject_file_id: &str,
        source_path: &Path,
        owner_id: &str,
    ) -> std::result::Result<JobHandle, QueueError> {
        self.queue(kind)
            .enqueue(subject_file_id, owner_id, self.payload_for(kind, source_path))
    }

    pub fn status_of(
        &self,
        kind: JobKind,
        subject_file_id: &str,
    ) -> std::result::Result<Option<JobStatusView>, QueueError> {
        self.queue(kind).status_of(subject_file_id)
    }

    pub fn has_cached_output(&self, kind: JobKind, subject_file_id: &str, owner_id: &str) -> bool {
        self.queue(kind).has_cached_output(subject_file_id, owner_id)
    }

    pub fn output_path_for(
        &self,
        kind: JobKind,
        subject_file_id: &str,
        owner_id: &str,
    ) -> std::result::Result<PathBuf, QueueError> {
        self.queue(kind).output_path_for(subject_file_id, owner_id)
    }

    /// Cache-first transcode request. `quality` falls back to the configured
    /// default.
    pub fn request_transcode(
        &self,
        subject_file_id: &str,
        source_path: &Path,
        owner_id: &str,
        quality: Option<TranscodeQuality>,
    ) -> std::result::Result<DerivativeOutcome, QueueError> {
        let quality = quality.unwrap_or(self.config.transcode.default_quality);
        let payload = JobPayload::new(source_path).with_quality(quality);
        self.transcode.request(subject_file_id, owner_id, payload)
    }

    pub fn request_thumbnail(
        &self,
        subject_file_id: &str,
        source_path: &Path,
        owner_id: &str,
    ) -> std::result::Result<DerivativeOutcome, QueueError> {
        self.thumbnail
            .request(subject_file_id, owner_id, JobPayload::new(source_path))
    }

    pub fn request_document_preview(
        &self,
        subject_file_id: &str,
        source_path: &Path,
        owner_id: &str,
    ) -> std::result::Result<DerivativeOutcome, QueueError> {
        self.document_preview
            .request(subject_file_id, owner_id, JobPayload::new(source_path))
    }

    fn payload_for(&self, kind: JobKind, source_path: &Path) -> JobPayload {
        let payload = JobPayload::new(source_path);
        match kind {
            JobKind::Transcode => payload.with_quality(self.config.transcode.default_quality),
            JobKind::Thumbnail | JobKind::DocumentPreview => payload,
        }
    }

    // --- admin surface ---

    pub fn retry_all_failed(&self) -> std::result::Result<usize, DatabaseError> {
        self.recovery.retry_all_failed()
    }

    /// Uses the configured `staleAfterSecs`.
    pub fn clear_stalled_jobs(&self) -> std::result::Result<StallSweep, DatabaseError> {
        self.recovery
            .clear_stalled_jobs(self.config.recovery.stale_after())
    }

    pub fn cleanup_all_failed_jobs(&self) -> std::result::Result<usize, DatabaseError> {
        self.recovery.cleanup_all_failed_jobs()
    }

    pub fn cleanup_old_jobs(&self, days: u32) -> std::result::Result<usize, DatabaseError> {
        self.recovery.cleanup_old_jobs(days)
    }

    pub fn cancel_all_pending(&self) -> std::result::Result<usize, DatabaseError> {
        self.recovery.cancel_pending_jobs()
    }

    pub fn detailed_queue_stats(&self) -> std::result::Result<Vec<QueueStats>, DatabaseError> {
        self.recovery
            .detailed_queue_stats(self.config.recovery.stale_after())
    }

    // --- worker side ---

    /// Starts one pool per kind. Must be called inside a tokio runtime.
    pub fn start_workers(&self) -> WorkerSet {
        let pools = JobKind::ALL
            .into_iter()
            .map(|kind| {
                WorkerPool::start(
                    self.queue(kind).clone(),
                    self.db.clone(),
                    driver_for(kind, &self.config, &self.layout),
                    self.live.clone(),
                    self.broadcaster.clone(),
                    PoolSettings::for_kind(kind, &self.config),
                )
            })
            .collect();
        WorkerSet { pools }
    }

    pub fn maintenance(&self) -> MaintenanceScheduler {
        MaintenanceScheduler::new(self.recovery.clone(), &self.config.recovery)
    }
}

/// The running pools of a worker process.
pub struct WorkerSet {
    pools: Vec<WorkerPool>,
}

impl WorkerSet {
    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    pub fn shutdown(&self) {
        for pool in &self.pools {
            pool.shutdown();
        }
    }

    /// Waits for every pool, sharing one grace period. Returns how many
    /// workers had to be aborted.
    pub async fn wait(self, grace: Duration) -> usize {
        self.shutdown();
        let waits = self.pools.into_iter().map(|pool| pool.wait(grace));
        join_pool_waits(waits).await
    }
}

async fn join_pool_waits<F>(waits: impl Iterator<Item = F>) -> usize
where
    F: std::future::Future<Output = usize> + Send + 'static,
{
    let handles: Vec<_> = waits.map(tokio::spawn).collect();
    let mut aborted = 0;
    for handle in handles {
        match handle.await {
            Ok(n) => aborted += n,
            Err(e) => log::error!("Worker pool shutdown task failed: {}", e),
        }
    }
    aborted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use tempfile::TempDir;

    fn service() -> (ConversionService, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config::with_storage_root(dir.path());
        let db = Database::open_in_memory().unwrap();
        (ConversionService::with_database(config, db), dir)
    }

    #[test]
    fn test_open_creates_database_under_storage_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("derivatives");
        let service = ConversionService::open(Config::with_storage_root(&root)).unwrap();
        assert!(root.join("mediaforge.db").exists());
        assert_eq!(service.layout().root(), root.as_path());
    }

    #[test]
    fn test_enqueue_uses_default_quality_for_transcodes() {
        let (service, _dir) = service();
        let handle = service
            .enqueue(JobKind::Transcode, "f1", Path::new("/in/a.mov"), "u1")
            .unwrap();
        let job = service
            .queue(JobKind::Transcode)
            .job(&handle.job_id)
            .unwrap()
            .unwrap();
        assert_eq!(job.payload.quality, Some(TranscodeQuality::Medium));
    }

    #[test]
    fn test_queues_are_independent_per_kind() {
        let (service, _dir) = service();
        let a = service
            .enqueue(JobKind::Thumbnail, "f1", Path::new("/in/a.mov"), "u1")
            .unwrap();
        let b = service
            .enqueue(JobKind::Transcode, "f1", Path::new("/in/a.mov"), "u1")
            .unwrap();
        assert!(a.created && b.created);
        assert_ne!(a.job_id, b.job_id);

        assert_eq!(
            service.status_of(JobKind::Thumbnail, "f1").unwrap().unwrap().job_id,
            a.job_id
        );
        assert!(service
            .status_of(JobKind::DocumentPreview, "f1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_admin_surface_spans_kinds() {
        let (service, _dir) = service();
        for kind in JobKind::ALL {
            service
                .enqueue(kind, "f1", Path::new("/in/a.pdf"), "u1")
                .unwrap();
        }
        assert_eq!(service.cancel_all_pending().unwrap(), 3);
        std::thread::sleep(Duration::from_millis(5));

        let stats = service.detailed_queue_stats().unwrap();
        assert!(stats.iter().all(|s| s.cancelled == 1 && s.queued == 0));
        assert_eq!(service.cleanup_old_jobs(0).unwrap(), 3);
        assert_eq!(service.retry_all_failed().unwrap(), 0);
        assert_eq!(service.clear_stalled_jobs().unwrap().total(), 0);
        assert_eq!(service.cleanup_all_failed_jobs().unwrap(), 0);
    }

    #[test]
    fn test_request_document_preview_is_cache_first() {
        let (service, _dir) = service();
        let source = Path::new("/in/report.docx");
        let first = service.request_document_preview("f1", source, "u1").unwrap();
        let job_id = match first {
            DerivativeOutcome::Pending { job } => {
                assert_eq!(job.status, JobStatus::Queued);
                job.job_id
            }
            other => panic!("Expected pending, got {:?}", other),
        };

        let path = service
            .output_path_for(JobKind::DocumentPreview, "f1", "u1")
            .unwrap();
        ensure_directory(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"%PDF-1.7").unwrap();

        assert!(service.has_cached_output(JobKind::DocumentPreview, "f1", "u1"));
        assert_eq!(
            service.request_document_preview("f1", source, "u1").unwrap(),
            DerivativeOutcome::Ready { path }
        );
        assert!(!job_id.is_empty());
    }

    #[tokio::test]
    async fn test_worker_set_starts_and_stops_all_pools() {
        let (service, _dir) = service();
        let workers = service.start_workers();
        let kinds: Vec<_> = workers.pools().iter().map(|p| p.kind()).collect();
        assert_eq!(kinds, JobKind::ALL.to_vec());
        assert_eq!(workers.wait(Duration::from_secs(5)).await, 0);
    }
}
