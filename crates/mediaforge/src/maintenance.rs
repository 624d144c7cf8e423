//! Periodic stall sweep and retention cleanup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::RecoveryConfig;
use crate::recovery::RecoveryOps;

/// Runs `clear_stalled_jobs` and `cleanup_old_jobs` on a fixed interval.
pub struct MaintenanceScheduler {
    ops: RecoveryOps,
    interval: Duration,
    stale_after: Duration,
    retention_days: u32,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub requeued: usize,
    pub failed: usize,
    pub deleted: usize,
}

impl MaintenanceScheduler {
    pub fn new(ops: RecoveryOps, recovery: &RecoveryConfig) -> Self {
        Self {
            ops,
            interval: recovery.sweep_interval(),
            stale_after: recovery.stale_after(),
            retention_days: recovery.retention_days,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Runs one pass immediately. Errors are logged, not returned.
    pub fn run_once(&self) -> MaintenanceReport {
        run_pass(&self.ops, self.stale_after, self.retention_days)
    }

    /// Starts the sweep loop on the current tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let ops = self.ops.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let interval = self.interval;
        let stale_after = self.stale_after;
        let retention_days = self.retention_days;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            log::info!("Maintenance scheduler started (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {},
                    _ = wake.notified() => {},
                }

                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                let ops = ops.clone();
                let pass = tokio::task::spawn_blocking(move || {
                    run_pass(&ops, stale_after, retention_days)
                });
                if let Err(e) = pass.await {
                    log::error!("Maintenance pass panicked: {}", e);
                }
            }
            log::info!("Maintenance scheduler stopped");
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

fn run_pass(ops: &RecoveryOps, stale_after: Duration, retention_days: u32) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    match ops.clear_stalled_jobs(stale_after) {
        Ok(sweep) => {
            report.requeued = sweep.requeued;
            report.failed = sweep.failed;
        }
        Err(e) => log::error!("Stall sweep failed: {}", e),
    }

    match ops.cleanup_old_jobs(retention_days) {
        Ok(deleted) => report.deleted = deleted,
        Err(e) => log::error!("Job cleanup failed: {}", e),
    }

    log::debug!(
        "Maintenance pass: {} requeued, {} failed, {} deleted",
        report.requeued,
        report.failed,
        report.deleted
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repo::tests::{seed, test_db};
    use crate::job::{JobKind, JobStatus};
    use chrono::Utc;

    fn recovery(sweep_interval_secs: u64) -> RecoveryConfig {
        RecoveryConfig {
            stale_after_secs: 60,
            sweep_interval_secs,
            ..RecoveryConfig::default()
        }
    }

    #[test]
    fn test_run_once_sweeps_and_cleans() {
        let db = test_db();
        let hours_ago = |h| Utc::now() - chrono::Duration::hours(h);
        seed(&db, "f1", JobKind::Transcode, JobStatus::Processing, hours_ago(2));
        seed(&db, "f2", JobKind::Thumbnail, JobStatus::Completed, hours_ago(24 * 30));
        seed(&db, "f3", JobKind::Thumbnail, JobStatus::Completed, hours_ago(1));

        let scheduler = MaintenanceScheduler::new(RecoveryOps::new(db, 3), &recovery(300));
        assert_eq!(
            scheduler.run_once(),
            MaintenanceReport {
                requeued: 1,
                failed: 0,
                deleted: 1
            }
        );
    }

    #[tokio::test]
    async fn test_scheduler_shutdown() {
        let db = test_db();
        let scheduler = MaintenanceScheduler::new(RecoveryOps::new(db, 3), &recovery(3600));
        let handle = scheduler.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .expect("scheduler task panicked");
    }
}
