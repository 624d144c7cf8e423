use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;

use crate::broadcast::{JobProgressEvent, LiveProgress, ProgressBroadcaster};
use crate::config::schema::MAX_DURATION_SECS;
use crate::config::Config;
use crate::db::job_repo;
use crate::db::{Database, DatabaseError};
use crate::driver::{Driver, DriverOutput, DriverRequest, ProgressSink};
use crate::error::DriverError;
use crate::job::{ConversionJob, JobKind};
use crate::queue::ConversionQueue;
use crate::sanitize::hash_path;
use crate::storage::{ensure_directory, is_usable_artifact, remove_quietly, StorageLayout};

/// Extra time past a driver's own deadline before the worker gives up on it.
const DEADLINE_SLACK: Duration = Duration::from_secs(5);
/// Longest a single job or shutdown wait may be scheduled for.
const MAX_WAIT: Duration = Duration::from_secs(MAX_DURATION_SECS);
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);
const MIN_IDLE_POLL: Duration = Duration::from_millis(1);
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// Per-pool knobs derived from the `workers` and `recovery` config sections.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub concurrency: usize,
    pub idle_poll: Duration,
    pub progress_step: u8,
    pub heartbeat: Duration,
    /// Staging entries older than this are removed when the pool starts.
    pub staging_max_age: Duration,
}

impl PoolSettings {
    /// Thumbnail pools run `thumbnailMultiplier` times the base concurrency.
    pub fn for_kind(kind: JobKind, config: &Config) -> Self {
        let workers = &config.workers;
        let base = workers.concurrency.max(1);
        let concurrency = match kind {
            JobKind::Thumbnail => base.saturating_mul(workers.thumbnail_multiplier.max(1)),
            JobKind::Transcode | JobKind::DocumentPreview => base,
        };
        Self {
            concurrency,
            idle_poll: workers.idle_poll(),
            progress_step: workers.progress_step.clamp(1, 100),
            heartbeat: workers.heartbeat(),
            staging_max_age: config.recovery.stale_after(),
        }
    }

    /// Brings hand-built settings into the ranges the workers rely on.
    fn normalized(self) -> Self {
        Self {
            concurrency: self.concurrency.max(1),
            idle_poll: self.idle_poll.clamp(MIN_IDLE_POLL, MAX_WAIT),
            progress_step: self.progress_step.clamp(1, 100),
            heartbeat: self.heartbeat.clamp(MIN_HEARTBEAT, MAX_WAIT),
            staging_max_age: self.staging_max_age.min(MAX_WAIT),
        }
    }
}

struct WorkerContext {
    kind: JobKind,
    queue: ConversionQueue,
    db: Database,
    layout: StorageLayout,
    driver: Arc<dyn Driver>,
    live: LiveProgress,
    broadcaster: ProgressBroadcaster,
    settings: PoolSettings,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

/// Bounded-concurrency consumer of one kind's queue.
pub struct WorkerPool {
    kind: JobKind,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl WorkerPool {
    /// Spawns the worker tasks. Must be called inside a tokio runtime.
    pub fn start(
        queue: ConversionQueue,
        db: Database,
        driver: Arc<dyn Driver>,
        live: LiveProgress,
        broadcaster: ProgressBroadcaster,
        settings: PoolSettings,
    ) -> Self {
        let kind = queue.kind();
        let layout = queue.layout().clone();
        let settings = settings.normalized();
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        if let Err(e) = layout.sweep_staging(kind, settings.staging_max_age) {
            warn!("Failed to sweep {} staging area: {}", kind, e);
        }

        let ctx = Arc::new(WorkerContext {
            kind,
            queue,
            db,
            layout,
            driver,
            live,
            broadcaster,
            settings,
            shutdown: Arc::clone(&shutdown),
            wake: Arc::clone(&wake),
        });

        let count = ctx.settings.concurrency;
        let workers = (0..count)
            .map(|worker_id| tokio::spawn(run_worker(worker_id, Arc::clone(&ctx))))
            .collect();

        info!("Started {} {} workers", count, kind);

        Self {
            kind,
            workers,
            shutdown,
            wake,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stops claiming new jobs. In-flight jobs keep running.
    pub fn shutdown(&self) {
        info!("Shutting down {} worker pool...", self.kind);
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Waits up to `grace` for in-flight jobs, then aborts what is left.
    ///
    /// Aborted jobs stay `processing` in the store; their subprocesses are
    /// killed when the task drops them. Returns the number of aborted workers.
    pub async fn wait(self, grace: Duration) -> usize {
        if !self.is_shutdown() {
            self.shutdown();
        }

        let deadline = Instant::now() + grace.min(MAX_WAIT);
        let mut aborted = 0;
        for (i, mut worker) in self.workers.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => debug!("{} worker {} finished", self.kind, i),
                Ok(Err(e)) => error!("{} worker {} panicked: {:?}", self.kind, i, e),
                Err(_) => {
                    worker.abort();
                    aborted += 1;
                    warn!(
                        "{} worker {} still busy after {:?}; aborting, its job is left for the stall sweep",
                        self.kind, i, grace
                    );
                }
            }
        }

        info!("All {} workers have stopped", self.kind);
        aborted
    }
}

/// Runs a store call on the blocking thread pool.
async fn with_db<T, F>(db: &Database, f: F) -> Result<T, DatabaseError>
where
    F: FnOnce(&Database) -> Result<T, DatabaseError> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
}

async fn run_worker(worker_id: usize, ctx: Arc<WorkerContext>) {
    debug!("{} worker {} started", ctx.kind, worker_id);

    loop {
        if ctx.shutdown.load(Ordering::Acquire) {
            debug!("{} worker {} received shutdown signal", ctx.kind, worker_id);
            break;
        }

        let queue = ctx.queue.clone();
        match tokio::task::spawn_blocking(move || queue.claim_next()).await {
            Ok(Ok(Some(job))) => process_job(worker_id, &ctx, job).await,
            Ok(Ok(None)) => idle(&ctx).await,
            Ok(Err(e)) => {
                error!("{} worker {} failed to claim a job: {}", ctx.kind, worker_id, e);
                idle(&ctx).await;
            }
            Err(e) => {
                error!("{} worker {} claim task failed: {}", ctx.kind, worker_id, e);
                idle(&ctx).await;
            }
        }
    }
}

async fn idle(ctx: &WorkerContext) {
    tokio::select! {
        _ = tokio::time::sleep(ctx.settings.idle_poll) => {}
        _ = ctx.wake.notified() => {}
    }
}

async fn process_job(worker_id: usize, ctx: &Arc<WorkerContext>, job: ConversionJob) {
    info!(
        "{} worker {} claimed job {} for file {} (attempt {})",
        ctx.kind, worker_id, job.id, job.subject_file_id, job.attempts
    );
    ctx.live.set(&job.id, 0);
    ctx.broadcaster.send(JobProgressEvent::started(&job));

    let span = tracing::info_span!(
        "worker.job",
        job_id = %job.id,
        kind = %job.kind,
        attempt = job.attempts,
        source = %hash_path(&job.payload.source_path),
    );

    // A panic in the conversion task fails this job only. Dropping the set
    // when the worker is aborted cancels the conversion.
    let mut conversion = JoinSet::new();
    conversion.spawn({
        let ctx = Arc::clone(ctx);
        let job = job.clone();
        async move { execute(&ctx, &job).await }.instrument(span)
    });
    let result = match conversion.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) => {
            if let Ok(staging_path) = ctx.layout.staging_path(job.kind, &job.owner_id, &job.id) {
                remove_quietly(&staging_path);
            }
            Err(DriverError::Panicked(describe_join_error(e)))
        }
        None => Err(DriverError::Panicked("conversion task missing".to_string())),
    };
    ctx.live.remove(&job.id);

    let job_id = job.id.clone();
    let attempt = job.attempts;
    match result {
        Ok(output_path) => {
            let path = output_path.to_string_lossy().into_owned();
            let stored = path.clone();
            let write = with_db(&ctx.db, move |db| {
                job_repo::mark_completed(db, &job_id, attempt, &stored, Utc::now())
            });
            match write.await {
                Ok(true) => {
                    info!("{} job {} completed: {}", ctx.kind, job.id, path);
                    ctx.broadcaster
                        .send(JobProgressEvent::completed(&job, &output_path));
                }
                Ok(false) => warn!(
                    "{} job {} finished but attempt {} no longer owns it; result not recorded",
                    ctx.kind, job.id, attempt
                ),
                Err(e) => error!("Failed to record completion of job {}: {}", job.id, e),
            }
        }
        Err(e) => {
            let message = e.to_string();
            let stored = message.clone();
            let write = with_db(&ctx.db, move |db| {
                job_repo::mark_failed(db, &job_id, attempt, &stored, Utc::now())
            });
            match write.await {
                Ok(true) => {
                    warn!("{} job {} failed: {}", ctx.kind, job.id, message);
                    ctx.broadcaster.send(JobProgressEvent::failed(&job, &message));
                }
                Ok(false) => warn!(
                    "{} job {} failed ({}) but attempt {} no longer owns it",
                    ctx.kind, job.id, message, attempt
                ),
                Err(db_err) => error!("Failed to record failure of job {}: {}", job.id, db_err),
            }
        }
    }
}

fn describe_join_error(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Runs the driver, persisting progress as it streams in, and promotes the
/// result. Returns the final artifact path.
async fn execute(ctx: &WorkerContext, job: &ConversionJob) -> Result<PathBuf, DriverError> {
    let staging_path = ctx.layout.staging_path(job.kind, &job.owner_id, &job.id)?;
    let final_path = ctx
        .layout
        .final_path(job.kind, &job.owner_id, &job.subject_file_id)?;
    if let Some(parent) = staging_path.parent() {
        ensure_directory(parent)?;
    }

    let timeout = ctx.driver.timeout().min(MAX_WAIT);
    let request = DriverRequest {
        job_id: job.id.clone(),
        subject_file_id: job.subject_file_id.clone(),
        owner_id: job.owner_id.clone(),
        payload: job.payload.clone(),
        staging_path: staging_path.clone(),
        deadline: Instant::now() + timeout,
    };

    let (tx, mut rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
    let run = tokio::time::timeout_at(
        request.deadline + DEADLINE_SLACK,
        ctx.driver.run(&request, ProgressSink::new(tx)),
    );
    tokio::pin!(run);

    let mut throttle = ProgressThrottle::new(ctx.settings.progress_step);
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + ctx.settings.heartbeat,
        ctx.settings.heartbeat,
    );

    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            Some(percent) = rx.recv() => {
                ctx.live.set(&job.id, percent);
                if throttle.should_persist(percent) {
                    persist_progress(ctx, job, percent).await;
                    throttle.persisted(percent);
                }
            }
            _ = heartbeat.tick() => {
                let percent = ctx.live.get(&job.id).unwrap_or(0);
                persist_progress(ctx, job, percent).await;
                throttle.persisted(percent);
            }
        }
    };

    let output = match outcome {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            remove_quietly(&staging_path);
            return Err(e);
        }
        Err(_) => {
            remove_quietly(&staging_path);
            return Err(DriverError::Timeout {
                program: format!("{} driver", job.kind),
                after: timeout,
            });
        }
    };

    let artifact = match output {
        DriverOutput::Staged(staged) => {
            ctx.layout.promote(&staged, &final_path)?;
            final_path
        }
        DriverOutput::Cached(path) => path,
    };

    if !is_usable_artifact(&artifact) {
        return Err(DriverError::MissingOutput(artifact));
    }
    Ok(artifact)
}

async fn persist_progress(ctx: &WorkerContext, job: &ConversionJob, percent: u8) {
    let job_id = job.id.clone();
    let attempt = job.attempts;
    let write = with_db(&ctx.db, move |db| {
        job_repo::update_progress(db, &job_id, attempt, percent, Utc::now())
    });
    match write.await {
        Ok(true) => {
            debug!("{} job {} progress {}%", ctx.kind, job.id, percent);
            ctx.broadcaster.send(JobProgressEvent::progress(job, percent));
        }
        Ok(false) => debug!("Progress write for job {} skipped", job.id),
        Err(e) => warn!("Failed to persist progress for job {}: {}", job.id, e),
    }
}

/// Decides which progress values reach the database: only those that cross
/// into a new `step`-sized band.
#[derive(Debug)]
struct ProgressThrottle {
    step: u8,
    last: u8,
}

impl ProgressThrottle {
    fn new(step: u8) -> Self {
        Self {
            step: step.max(1),
            last: 0,
        }
    }

    fn should_persist(&self, percent: u8) -> bool {
        percent > self.last && percent / self.step > self.last / self.step
    }

    fn persisted(&mut self, percent: u8) {
        self.last = self.last.max(percent);
    }
}
