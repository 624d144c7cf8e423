//! Test harness for isolated pipeline runs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use mediaforge::config::Config;
use mediaforge::ConversionService;

use super::fakes;

/// Isolated environment: storage root, input files and fake binaries under
/// one temp directory.
pub struct TestHarness {
    temp_dir: TempDir,
    pub input_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub config: Config,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let input_dir = base.join("input");
        let storage_dir = base.join("storage");
        let bin_dir = base.join("bin");
        for dir in [&input_dir, &storage_dir, &bin_dir] {
            std::fs::create_dir_all(dir).expect("Failed to create harness dir");
        }

        let mut config = Config::with_storage_root(&storage_dir);
        config.binaries.ffprobe = fakes::install(&bin_dir, "ffprobe", fakes::FFPROBE);
        config.binaries.ffmpeg = fakes::install(&bin_dir, "ffmpeg", fakes::FFMPEG);
        config.binaries.soffice = fakes::install(&bin_dir, "soffice", fakes::SOFFICE);
        config.binaries.pdftoppm = fakes::install(&bin_dir, "pdftoppm", fakes::PDFTOPPM);
        config.workers.concurrency = 2;
        config.workers.idle_poll_ms = 20;
        config.workers.shutdown_grace_secs = 5;
        config.timeouts.transcode_secs = 30;
        config.timeouts.thumbnail_secs = 30;
        config.timeouts.document_secs = 30;
        config.timeouts.probe_secs = 10;

        Self {
            temp_dir,
            input_dir,
            storage_dir,
            bin_dir,
            config,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Opens a service on the harness database file. Several services may be
    /// open at once, like a request process next to a worker process.
    pub fn service(&self) -> ConversionService {
        ConversionService::open(self.config.clone()).expect("Failed to open service")
    }

    pub fn write_input(&self, filename: &str, content: &[u8]) -> PathBuf {
        let path = self.input_dir.join(filename);
        std::fs::write(&path, content).expect("Failed to write input file");
        path
    }

    /// Replaces a fake binary's behavior.
    pub fn replace_binary(&self, name: &str, body: &str) {
        fakes::install(&self.bin_dir, name, body);
    }

    pub fn calls(&self, name: &str) -> usize {
        fakes::calls(&self.bin_dir, name)
    }

    pub fn set_delay(&self, name: &str, seconds: f32) {
        fakes::set_delay(&self.bin_dir, name, seconds);
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `check` every 20ms until it yields a value or `timeout` passes.
pub async fn wait_for<T, F>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
