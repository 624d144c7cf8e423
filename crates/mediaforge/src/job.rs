//! Conversion job model shared by the queue, the workers and the recovery
//! operations.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The conversion category. One queue and one worker pool exist per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Transcode,
    Thumbnail,
    DocumentPreview,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::Transcode,
        JobKind::Thumbnail,
        JobKind::DocumentPreview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transcode => "transcode",
            JobKind::Thumbnail => "thumbnail",
            JobKind::DocumentPreview => "document_preview",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcode" => Some(JobKind::Transcode),
            "thumbnail" => Some(JobKind::Thumbnail),
            "document_preview" => Some(JobKind::DocumentPreview),
            _ => None,
        }
    }

    /// File extension of the artifact this kind produces.
    pub fn artifact_extension(&self) -> &'static str {
        match self {
            JobKind::Transcode => "mp4",
            JobKind::Thumbnail => "png",
            JobKind::DocumentPreview => "pdf",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle state.
///
/// `Queued -> Processing -> Completed | Failed`, `Queued -> Cancelled`;
/// administrative resets move `Failed` and stalled `Processing` back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder preset for transcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeQuality {
    Low,
    #[default]
    Medium,
    High,
}

/// Per-job input description, persisted as JSON alongside the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub source_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<TranscodeQuality>,
}

impl JobPayload {
    /// Creates a payload for the given source, detecting the MIME type from
    /// the file extension.
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        let source_path = source_path.into();
        let mime_type = detect_mime_type(&source_path);
        Self {
            source_path,
            mime_type,
            quality: None,
        }
    }

    /// Overrides the detected MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_quality(mut self, quality: TranscodeQuality) -> Self {
        self.quality = Some(quality);
        self
    }
}

fn detect_mime_type(path: &Path) -> Option<String> {
    mime_guess::from_path(path).first().map(|m| m.to_string())
}

/// One unit of conversion work and its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionJob {
    pub id: String,
    pub subject_file_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub attempts: u32,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub owner_id: String,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What `enqueue` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// False when an already active job for the same subject was returned.
    pub created: bool,
}

impl JobHandle {
    pub fn for_job(job: &ConversionJob, created: bool) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            status: job.status,
            created,
        }
    }
}

/// Caller-facing status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

impl From<&ConversionJob> for JobStatusView {
    fn from(job: &ConversionJob) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress_percent,
            error: job.error.clone(),
            output_path: job.output_path.clone(),
        }
    }
}
