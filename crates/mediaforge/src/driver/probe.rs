use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use crate::driver::process::ScopedProcess;
use crate::error::DriverError;

/// Asks the prober for the container duration of `input`.
///
/// The probe gets its own short deadline, never later than the job's.
pub async fn probe_duration(
    ffprobe: &Path,
    input: &Path,
    timeout: Duration,
    job_deadline: Instant,
) -> Result<Duration, DriverError> {
    let deadline = (Instant::now() + timeout).min(job_deadline);
    let stdout = ScopedProcess::new(ffprobe, deadline)
        .args(["-v", "error", "-show_entries", "format=duration"])
        .args(["-of", "default=noprint_wrappers=1:nokey=1"])
        .arg(input)
        .scrub(input)
        .output()
        .await?;

    parse_duration(&stdout)
}

/// Parses the first numeric line of prober output as seconds.
pub fn parse_duration(stdout: &str) -> Result<Duration, DriverError> {
    let secs = stdout
        .lines()
        .map(str::trim)
        .find_map(|line| line.parse::<f64>().ok())
        .ok_or_else(|| {
            DriverError::Probe(format!("no duration in prober output: {:?}", stdout.trim()))
        })?;

    if !secs.is_finite() || secs <= 0.0 {
        return Err(DriverError::Probe(format!("invalid duration {}", secs)));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|_| DriverError::Probe(format!("duration out of range: {:e}", secs)))
}
