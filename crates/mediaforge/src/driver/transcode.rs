use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use crate::config::Config;
use crate::driver::format::{describe_source, SourceFormat};
use crate::driver::probe::probe_duration;
use crate::driver::process::ScopedProcess;
use crate::driver::{require_input, Driver, DriverOutput, DriverRequest, ProgressSink};
use crate::error::DriverError;
use crate::job::{JobKind, TranscodeQuality};
use crate::sanitize::redact_path;
use crate::storage::is_usable_artifact;

/// Encoder settings fixed by a quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    /// Output height cap; sources smaller than this are not upscaled.
    pub max_height: u32,
    pub speed: &'static str,
}

impl Preset {
    pub fn for_quality(quality: TranscodeQuality) -> Self {
        match quality {
            TranscodeQuality::Low => Preset {
                video_bitrate_kbps: 800,
                audio_bitrate_kbps: 96,
                max_height: 480,
                speed: "veryfast",
            },
            TranscodeQuality::Medium => Preset {
                video_bitrate_kbps: 2500,
                audio_bitrate_kbps: 128,
                max_height: 720,
                speed: "fast",
            },
            TranscodeQuality::High => Preset {
                video_bitrate_kbps: 5000,
                audio_bitrate_kbps: 192,
                max_height: 1080,
                speed: "slow",
            },
        }
    }

    fn encoder_args(&self) -> Vec<String> {
        let vb = format!("{}k", self.video_bitrate_kbps);
        vec![
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            self.speed.into(),
            "-b:v".into(),
            vb.clone(),
            "-maxrate".into(),
            vb,
            "-bufsize".into(),
            format!("{}k", self.video_bitrate_kbps * 2),
            "-vf".into(),
            format!("scale=-2:'min({},ih)'", self.max_height),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            format!("{}k", self.audio_bitrate_kbps),
            "-movflags".into(),
            "+faststart".into(),
        ]
    }
}

/// Converts video sources to H.264/AAC MP4.
pub struct TranscodeDriver {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
    probe_timeout: Duration,
    default_quality: TranscodeQuality,
}

impl TranscodeDriver {
    pub fn new(config: &Config) -> Self {
        Self {
            ffmpeg: config.binaries.ffmpeg.clone(),
            ffprobe: config.binaries.ffprobe.clone(),
            timeout: config.timeouts.transcode(),
            probe_timeout: config.timeouts.probe(),
            default_quality: config.transcode.default_quality,
        }
    }

    async fn transcode(
        &self,
        request: &DriverRequest,
        progress: ProgressSink,
    ) -> Result<DriverOutput, DriverError> {
        let source = &request.payload.source_path;
        require_input(request)?;

        match SourceFormat::detect(&request.payload) {
            Some(SourceFormat::Video) => {}
            _ => {
                return Err(DriverError::UnsupportedFormat(describe_source(
                    &request.payload,
                )))
            }
        }

        let total = probe_duration(&self.ffprobe, source, self.probe_timeout, request.deadline)
            .await?;
        let quality = request.payload.quality.unwrap_or(self.default_quality);
        let preset = Preset::for_quality(quality);

        log::debug!(
            "Transcoding {} ({:.1}s) at {:?}",
            redact_path(source),
            total.as_secs_f64(),
            quality
        );

        let mut tracker = ProgressTracker::new(total);
        ScopedProcess::new(&self.ffmpeg, request.deadline)
            .args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error"])
            .arg("-i")
            .arg(source)
            .args(preset.encoder_args())
            .args(["-progress", "pipe:1", "-nostats", "-f", "mp4"])
            .arg(&request.staging_path)
            .scrub(source)
            .scrub(&request.staging_path)
            .stream(|line| {
                if let Some(percent) = tracker.observe(line) {
                    progress.report(percent);
                }
            })
            .await?;

        if !is_usable_artifact(&request.staging_path) {
            return Err(DriverError::MissingOutput(request.staging_path.clone()));
        }

        progress.report(100);
        Ok(DriverOutput::Staged(request.staging_path.clone()))
    }
}

#[async_trait]
impl Driver for TranscodeDriver {
    fn kind(&self) -> JobKind {
        JobKind::Transcode
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
            "driver.transcode",
            job_id = %request.job_id,
            file = %redact_path(&request.payload.source_path),
        );
        self.transcode(request, progress).instrument(span).await
    }
}

/// Turns the encoder's `-progress` key/value stream into percentages.
#[derive(Debug)]
pub struct ProgressTracker {
    total: Duration,
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn new(total: Duration) -> Self {
        Self { total, last: None }
    }

    /// Feeds one line; returns a percentage when it moved forward.
    /// Values stay within 0..=99 until the encoder exits cleanly.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let elapsed = parse_elapsed(line)?;
        if self.total.is_zero() {
            return None;
        }
        let ratio = elapsed.as_secs_f64() / self.total.as_secs_f64();
        let percent = (ratio * 100.0).floor().clamp(0.0, 99.0) as u8;
        if self.last.is_some_and(|last| percent <= last) {
            return None;
        }
        self.last = Some(percent);
        Some(percent)
    }
}

/// Extracts elapsed output time from a `-progress` line
/// (`out_time_us=…` or `out_time=HH:MM:SS.micros`).
pub fn parse_elapsed(line: &str) -> Option<Duration> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" => value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|us| *us >= 0)
            .map(|us| Duration::from_micros(us as u64)),
        "out_time" => parse_clock(value.trim()),
        _ => None,
    }
}

fn parse_clock(value: &str) -> Option<Duration> {
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = hours.checked_mul(3600)?.checked_add(minutes.checked_mul(60)?)?;
    Duration::from_secs(whole).checked_add(Duration::try_from_secs_f64(seconds).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_scale_with_quality() {
        let low = Preset::for_quality(TranscodeQuality::Low);
        let medium = Preset::for_quality(TranscodeQuality::Medium);
        let high = Preset::for_quality(TranscodeQuality::High);
        assert!(low.video_bitrate_kbps < medium.video_bitrate_kbps);
        assert!(medium.video_bitrate_kbps < high.video_bitrate_kbps);
        assert!(low.max_height < medium.max_height && medium.max_height < high.max_height);
        assert_eq!(medium.speed, "fast");
    }

    #[test]
    fn test_encoder_args() {
        let args = Preset::for_quality(TranscodeQuality::Medium).encoder_args();
        let joined = args.join(" ");
        assert!(joined.contains("-b:v 2500k"));
        assert!(joined.contains("-bufsize 5000k"));
        assert!(joined.contains("-b:a 128k"));
        assert!(joined.contains("scale=-2:'min(720,ih)'"));
    }

    #[test]
    fn test_parse_elapsed() {
        assert_eq!(
            parse_elapsed("out_time_us=15000000"),
            Some(Duration::from_secs(15))
        );
        assert_eq!(
            parse_elapsed("out_time=00:01:30.500000"),
            Some(Duration::from_millis(90_500))
        );
        assert_eq!(parse_elapsed("out_time=N/A"), None);
        assert_eq!(parse_elapsed("out_time_us=-9223372036854775807"), None);
        assert_eq!(parse_elapsed("frame=120"), None);
        assert_eq!(parse_elapsed("progress=continue"), None);
    }

    #[test]
    fn test_parse_elapsed_out_of_range() {
        assert_eq!(parse_elapsed("out_time=0:0:1e300"), None);
        assert_eq!(parse_elapsed("out_time=18446744073709551615:00:00.0"), None);
        assert_eq!(parse_elapsed("out_time=00:18446744073709551615:00.0"), None);
        assert_eq!(parse_elapsed("out_time=00:00:inf"), None);

        let mut tracker = ProgressTracker::new(Duration::from_secs(60));
        assert_eq!(tracker.observe("out_time=0:0:1e300"), None);
        assert_eq!(tracker.observe("out_time_us=18446744073709551615"), None);
    }

    #[test]
    fn test_tracker_is_monotonic_and_capped() {
        let mut tracker = ProgressTracker::new(Duration::from_secs(60));
        assert_eq!(tracker.observe("out_time=00:00:15.000000"), Some(25));
        assert_eq!(tracker.observe("out_time_us=15000000"), None);
        assert_eq!(tracker.observe("out_time=00:00:06.000000"), None);
        assert_eq!(tracker.observe("out_time=00:00:45.000000"), Some(75));
        assert_eq!(tracker.observe("out_time=00:01:00.000000"), Some(99));
        assert_eq!(tracker.observe("out_time=00:01:02.000000"), None);
    }

    #[test]
    fn test_tracker_ignores_zero_duration() {
        let mut tracker = ProgressTracker::new(Duration::ZERO);
        assert_eq!(tracker.observe("out_time_us=1000"), None);
    }

    #[tokio::test]
    async fn test_rejects_non_video() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.pdf");
        std::fs::write(&source, b"%PDF").unwrap();

        let driver = TranscodeDriver::new(&Config::with_storage_root(dir.path()));
        let request = DriverRequest {
            job_id: "j1".into(),
            subject_file_id: "f1".into(),
            owner_id: "u1".into(),
            payload: crate::job::JobPayload::new(&source),
            staging_path: dir.path().join("out.mp4"),
            deadline: tokio::time::Instant::now() + Duration::from_secs(5),
        };
        let err = driver.run(&request, ProgressSink::discard()).await.unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedFormat(_)));
    }
}
