//! Conversion drivers: one adapter per job kind, each shelling out to an
//! external binary (or, for raster images, working in-process).
//!
//! Drivers never touch the job store. They report progress through a
//! [`ProgressSink`] and return where they left the artifact; the worker owns
//! promotion and every database write.

pub mod document;
pub mod format;
pub mod probe;
pub mod process;
pub mod thumbnail;
pub mod transcode;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::DriverError;
use crate::job::{JobKind, JobPayload};
use crate::storage::StorageLayout;

pub use document::DocumentDriver;
pub use format::{OfficeFamily, SourceFormat};
pub use thumbnail::ThumbnailDriver;
pub use transcode::TranscodeDriver;

/// Everything a driver needs for one job.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub job_id: String,
    pub subject_file_id: String,
    pub owner_id: String,
    pub payload: JobPayload,
    /// Job-scoped temporary output location.
    pub staging_path: PathBuf,
    pub deadline: Instant,
}

/// Where a successful run left its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutput {
    /// Freshly written to the staging path; the worker promotes it.
    Staged(PathBuf),
    /// An artifact already in its final location was reused.
    Cached(PathBuf),
}

/// Sending half of a driver's progress stream. Reports never block: when
/// the worker falls behind, intermediate values are dropped.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<u8>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<u8>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything, for nested conversions.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, percent: u8) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(percent.min(100));
        }
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Upper bound on one run, turned into the request deadline.
    fn timeout(&self) -> Duration;

    async fn run(
        &self,
        request: &DriverRequest,
        progress: ProgressSink,
    ) -> Result<DriverOutput, DriverError>;
}

/// Builds the driver for `kind`. Called once per pool.
pub fn driver_for(kind: JobKind, config: &Config, layout: &StorageLayout) -> Arc<dyn Driver> {
    match kind {
        JobKind::Transcode => Arc::new(TranscodeDriver::new(config)),
        JobKind::Thumbnail => Arc::new(ThumbnailDriver::new(config, layout.clone())),
        JobKind::DocumentPreview => Arc::new(DocumentDriver::new(config, layout.clone())),
    }
}

/// Fails fast when the source is gone; no subprocess is spawned for it.
pub(crate) fn require_input(request: &DriverRequest) -> Result<(), DriverError> {
    if request.payload.source_path.is_file() {
        Ok(())
    } else {
        Err(DriverError::InputNotFound(request.payload.source_path.clone()))
    }
}
