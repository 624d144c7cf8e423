use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::job::TranscodeQuality;

/// Upper bound for every configured duration, in seconds (30 days).
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Converts configured seconds into a duration within `1..=MAX_DURATION_SECS`.
/// Values set in code bypass schema validation and end up here.
fn bounded_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(1, MAX_DURATION_SECS))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub version: String,
    pub storage_root: PathBuf,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub binaries: BinariesConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
}

impl Config {
    /// Builds a configuration with every optional section at its default.
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            version: "1.0".to_string(),
            storage_root: storage_root.into(),
            database_path: None,
            log_format: LogFormat::default(),
            workers: WorkersConfig::default(),
            recovery: RecoveryConfig::default(),
            binaries: BinariesConfig::default(),
            timeouts: TimeoutsConfig::default(),
            transcode: TranscodeConfig::default(),
            thumbnail: ThumbnailConfig::default(),
        }
    }

    /// The job database file, defaulting to `<storageRoot>/mediaforge.db`.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.storage_root.join("mediaforge.db"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkersConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_thumbnail_multiplier")]
    pub thumbnail_multiplier: usize,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Persist progress only when it crosses a multiple of this many percent.
    #[serde(default = "default_progress_step")]
    pub progress_step: u8,
    /// Persist progress at least this often so long jobs keep `updatedAt` fresh.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_concurrency() -> usize {
    (num_cpus::get() / 2).max(1)
}

fn default_thumbnail_multiplier() -> usize {
    2
}

fn default_idle_poll_ms() -> u64 {
    500
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_progress_step() -> u8 {
    10
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            thumbnail_multiplier: default_thumbnail_multiplier(),
            idle_poll_ms: default_idle_poll_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            progress_step: default_progress_step(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl WorkersConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.clamp(1, MAX_DURATION_SECS * 1000))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs.min(MAX_DURATION_SECS))
    }

    pub fn heartbeat(&self) -> Duration {
        bounded_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_stale_after_secs() -> u64 {
    1800
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    7
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            max_attempts: default_max_attempts(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RecoveryConfig {
    pub fn stale_after(&self) -> Duration {
        bounded_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        bounded_secs(self.sweep_interval_secs)
    }
}

/// Programs invoked for conversions. Bare names are resolved on `PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinariesConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    #[serde(default = "default_soffice")]
    pub soffice: PathBuf,
    #[serde(default = "default_pdftoppm")]
    pub pdftoppm: PathBuf,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_soffice() -> PathBuf {
    PathBuf::from("soffice")
}

fn default_pdftoppm() -> PathBuf {
    PathBuf::from("pdftoppm")
}

impl Default for BinariesConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            soffice: default_soffice(),
            pdftoppm: default_pdftoppm(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutsConfig {
    #[serde(default = "default_transcode_secs")]
    pub transcode_secs: u64,
    #[serde(default = "default_thumbnail_secs")]
    pub thumbnail_secs: u64,
    #[serde(default = "default_document_secs")]
    pub document_secs: u64,
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
}

fn default_transcode_secs() -> u64 {
    7200
}

fn default_thumbnail_secs() -> u64 {
    120
}

fn default_document_secs() -> u64 {
    300
}

fn default_probe_secs() -> u64 {
    30
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            transcode_secs: default_transcode_secs(),
            thumbnail_secs: default_thumbnail_secs(),
            document_secs: default_document_secs(),
            probe_secs: default_probe_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn transcode(&self) -> Duration {
        bounded_secs(self.transcode_secs)
    }

    pub fn thumbnail(&self) -> Duration {
        bounded_secs(self.thumbnail_secs)
    }

    pub fn document(&self) -> Duration {
        bounded_secs(self.document_secs)
    }

    pub fn probe(&self) -> Duration {
        bounded_secs(self.probe_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeConfig {
    #[serde(default)]
    pub default_quality: TranscodeQuality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumbnail_edge")]
    pub max_width: u32,
    #[serde(default = "default_thumbnail_edge")]
    pub max_height: u32,
}

fn default_thumbnail_edge() -> u32 {
    320
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_width: default_thumbnail_edge(),
            max_height: default_thumbnail_edge(),
        }
    }
}
