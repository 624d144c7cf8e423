use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::Config;
use crate::driver::format::{describe_source, OfficeFamily, SourceFormat};
use crate::driver::process::{program_name, ScopedProcess};
use crate::driver::{require_input, Driver, DriverOutput, DriverRequest, ProgressSink};
use crate::error::DriverError;
use crate::job::JobKind;
use crate::sanitize::redact_path;
use crate::storage::{ensure_directory, is_usable_artifact, remove_quietly, StorageLayout};

/// Office-to-PDF conversion through a headless document converter.
///
/// Cache-first: when a preview PDF already exists for the subject and owner
/// the converter is not started.
#[derive(Clone)]
pub struct DocumentDriver {
    soffice: PathBuf,
    timeout: Duration,
    layout: StorageLayout,
}

impl DocumentDriver {
    pub fn new(config: &Config, layout: StorageLayout) -> Self {
        Self {
            soffice: config.binaries.soffice.clone(),
            timeout: config.timeouts.document(),
            layout,
        }
    }

    /// Source families the converter is trusted with.
    pub fn supports(format: SourceFormat) -> bool {
        matches!(
            format,
            SourceFormat::Office(
                OfficeFamily::WordProcessing
                    | OfficeFamily::Spreadsheet
                    | OfficeFamily::Presentation
                    | OfficeFamily::RichText
            )
        )
    }

    pub fn cached_preview(&self, owner_id: &str, subject_file_id: &str) -> Option<PathBuf> {
        self.layout
            .cached_artifact(JobKind::DocumentPreview, owner_id, subject_file_id)
    }

    /// Converts `source` into a PDF at `output`. Scratch space (converter
    /// profile and output directory) lives next to `output` and is removed
    /// afterwards.
    pub async fn convert(
        &self,
        source: &Path,
        output: &Path,
        deadline: Instant,
    ) -> Result<(), DriverError> {
        let program = program_name(&self.soffice);
        let io_err = |e: std::io::Error| DriverError::Io {
            program: program.clone(),
            source: e,
        };

        let out_dir = std::path::absolute(output.with_extension("d")).map_err(io_err)?;
        let profile_dir = std::path::absolute(output.with_extension("profile")).map_err(io_err)?;
        ensure_directory(&out_dir)?;

        let result = ScopedProcess::new(&self.soffice, deadline)
            .arg(format!(
                "-env:UserInstallation=file://{}",
                profile_dir.display()
            ))
            .args(["--headless", "--norestore", "--nolockcheck"])
            .args(["--convert-to", "pdf", "--outdir"])
            .arg(&out_dir)
            .arg(source)
            .scrub(source)
            .output()
            .await
            .map(|_| ());

        let produced = source
            .file_stem()
            .map(|stem| out_dir.join(format!("{}.pdf", stem.to_string_lossy())));

        let outcome = result.and_then(|()| match produced {
            Some(ref pdf) if is_usable_artifact(pdf) => {
                std::fs::rename(pdf, output).map_err(|e| DriverError::Io {
                    program: program.clone(),
                    source: e,
                })
            }
            _ => Err(DriverError::MissingOutput(output.to_path_buf())),
        });

        remove_quietly(&out_dir);
        remove_quietly(&profile_dir);
        outcome
    }

    async fn preview(
        &self,
        request: &DriverRequest,
        progress: ProgressSink,
    ) -> Result<DriverOutput, DriverError> {
        match SourceFormat::detect(&request.payload) {
            Some(format) if Self::supports(format) => {}
            _ => {
                return Err(DriverError::UnsupportedFormat(describe_source(
                    &request.payload,
                )))
            }
        }

        if let Some(cached) = self.cached_preview(&request.owner_id, &request.subject_file_id) {
            log::info!(
                "Reusing cached preview for file {} (job {})",
                request.subject_file_id,
                request.job_id
            );
            progress.report(100);
            return Ok(DriverOutput::Cached(cached));
        }

        require_input(request)?;
        self.convert(
            &request.payload.source_path,
            &request.staging_path,
            request.deadline,
        )
        .await?;

        progress.report(100);
        Ok(DriverOutput::Staged(request.staging_path.clone()))
    }
}

#[async_trait]
impl Driver for DocumentDriver {
    fn kind(&self) -> JobKind {
        JobKind::DocumentPreview
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        request: &DriverRequest,
        progress: ProgressSink,
    ) -> Result<DriverOutput, DriverError> {
        let span = tracing::info_span!(
            "driver.document",
            job_id = %request.job_id,
            file = %redact_path(&request.payload.source_path),
        );
        self.preview(request, progress).instrument(span).await
    }
}
