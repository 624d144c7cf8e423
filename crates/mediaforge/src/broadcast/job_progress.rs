//! Job progress broadcaster for real-time job status streaming.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{ConversionJob, JobKind, JobStatus};

/// Progress event for a conversion job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub kind: JobKind,
    pub subject_file_id: String,
    pub status: JobStatus,
    pub progress: u8,
    /// Error message (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Output path (set on completion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl JobProgressEvent {
    fn for_job(job: &ConversionJob, status: JobStatus, progress: u8) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            subject_file_id: job.subject_file_id.clone(),
            status,
            progress,
            error: None,
            output_path: None,
            timestamp: Utc::now(),
        }
    }

    /// A job was claimed by a worker.
    pub fn started(job: &ConversionJob) -> Self {
        Self::for_job(job, JobStatus::Processing, 0)
    }

    pub fn progress(job: &ConversionJob, progress: u8) -> Self {
        Self::for_job(job, JobStatus::Processing, progress)
    }

    pub fn completed(job: &ConversionJob, output_path: &Path) -> Self {
        let mut event = Self::for_job(job, JobStatus::Completed, 100);
        event.output_path = Some(output_path.to_path_buf());
        event
    }

    pub fn failed(job: &ConversionJob, error: &str) -> Self {
        let mut event = Self::for_job(job, JobStatus::Failed, job.progress_percent);
        event.error = Some(error.to_string());
        event
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl ProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
