use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use image::ImageFormat;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::Config;
use crate::driver::document::DocumentDriver;
use crate::driver::format::{describe_source, SourceFormat};
use crate::driver::process::ScopedProcess;
use crate::driver::{require_input, Driver, DriverOutput, DriverRequest, ProgressSink};
use crate::error::DriverError;
use crate::job::JobKind;
use crate::sanitize::redact_path;
use crate::storage::{ensure_directory, is_usable_artifact, StorageLayout};

/// Single PNG preview for images, videos, PDFs and office documents.
pub struct ThumbnailDriver {
    ffmpeg: PathBuf,
    pdftoppm: PathBuf,
    timeout: Duration,
    max_width: u32,
    max_height: u32,
    layout: StorageLayout,
    documents: DocumentDriver,
}

impl ThumbnailDriver {
    pub fn new(config: &Config, layout: StorageLayout) -> Self {
        Self {
            ffmpeg: config.binaries.ffmpeg.clone(),
            pdftoppm: config.binaries.pdftoppm.clone(),
            timeout: config.timeouts.thumbnail(),
            max_width: config.thumbnail.max_width,
            max_height: config.thumbnail.max_height,
            documents: DocumentDriver::new(config, layout.clone()),
            layout,
        }
    }

    async fn thumbnail(
        &self,
        request: &DriverRequest,
        progress: ProgressSink,
    ) -> Result<DriverOutput, DriverError> {
        let format = SourceFormat::detect(&request.payload).ok_or_else(|| {
            DriverError::UnsupportedFormat(describe_source(&request.payload))
        })?;
        let source = &request.payload.source_path;
        let output = &request.staging_path;

        match format {
            SourceFormat::Image => {
                require_input(request)?;
                render_image(source, output, self.max_width, self.max_height).await?;
            }
            SourceFormat::Video => {
                require_input(request)?;
                self.extract_frame(source, output, request.deadline).await?;
            }
            SourceFormat::Pdf => {
                require_input(request)?;
                self.rasterize_first_page(source, output, request.deadline)
                    .await?;
            }
            SourceFormat::Office(_) => {
                let pdf = self.office_preview(request).await?;
                progress.report(50);
                self.rasterize_first_page(&pdf, output, request.deadline)
                    .await?;
            }
        }

        if !is_usable_artifact(output) {
            return Err(DriverError::MissingOutput(output.clone()));
        }
        progress.report(100);
        Ok(DriverOutput::Staged(output.clone()))
    }

    async fn extract_frame(
        &self,
        source: &Path,
        output: &Path,
        deadline: Instant,
    ) -> Result<(), DriverError> {
        let filter = format!(
            "thumbnail,scale=w={}:h={}:force_original_aspect_ratio=decrease",
            self.max_width, self.max_height
        );
        ScopedProcess::new(&self.ffmpeg, deadline)
            .args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error"])
            .arg("-i")
            .arg(source)
            .args(["-vf", filter.as_str(), "-frames:v", "1"])
            .args(["-f", "image2", "-c:v", "png"])
            .arg(output)
            .scrub(source)
            .output()
            .await
            .map(|_| ())
    }

    /// Renders page 1 of `pdf` to `output` (a `.png` path).
    async fn rasterize_first_page(
        &self,
        pdf: &Path,
        output: &Path,
        deadline: Instant,
    ) -> Result<(), DriverError> {
        // pdftoppm appends `.png` to the prefix when `-singlefile` is set.
        let prefix = output.with_extension("");
        let edge = self.max_width.max(self.max_height);
        ScopedProcess::new(&self.pdftoppm, deadline)
            .args(["-png", "-singlefile", "-f", "1", "-l", "1"])
            .args(["-scale-to", edge.to_string().as_str()])
            .arg(pdf)
            .arg(&prefix)
            .scrub(pdf)
            .output()
            .await
            .map(|_| ())
    }

    /// Returns the preview PDF for an office source, converting and
    /// publishing it to the preview cache when it does not exist yet.
    async fn office_preview(&self, request: &DriverRequest) -> Result<PathBuf, DriverError> {
        if let Some(cached) = self
            .documents
            .cached_preview(&request.owner_id, &request.subject_file_id)
        {
            return Ok(cached);
        }

        require_input(request)?;
        let staged = self.layout.staging_path(
            JobKind::DocumentPreview,
            &request.owner_id,
            &request.job_id,
        )?;
        if let Some(parent) = staged.parent() {
            ensure_directory(parent)?;
        }
        self.documents
            .convert(&request.payload.source_path, &staged, request.deadline)
            .await?;

        let final_path = self.layout.final_path(
            JobKind::DocumentPreview,
            &request.owner_id,
            &request.subject_file_id,
        )?;
        self.layout.promote(&staged, &final_path)?;
        log::info!(
            "Published preview PDF for file {} while generating its thumbnail",
            request.subject_file_id
        );
        Ok(final_path)
    }
}

#[async_trait]
impl Driver for ThumbnailDriver {
    fn kind(&self) -> JobKind {
        JobKind::Thumbnail
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
            "driver.thumbnail",
            job_id = %request.job_id,
            file = %redact_path(&request.payload.source_path),
        );
        self.thumbnail(request, progress).instrument(span).await
    }
}

/// Decodes, downsizes and re-encodes a raster image off the async runtime.
async fn render_image(
    source: &Path,
    output: &Path,
    max_width: u32,
    max_height: u32,
) -> Result<(), DriverError> {
    let source = source.to_path_buf();
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let img = image::open(&source)
            .map_err(|e| DriverError::Image(format!("Failed to load image: {}", e)))?;
        img.thumbnail(max_width, max_height)
            .save_with_format(&output, ImageFormat::Png)
            .map_err(|e| DriverError::Image(format!("Failed to write thumbnail: {}", e)))
    })
    .await
    .map_err(|e| DriverError::Image(format!("Thumbnail task failed: {}", e)))?
}
