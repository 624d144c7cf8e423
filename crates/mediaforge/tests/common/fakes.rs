//! Fake converter binaries.
//!
//! Every script appends its name to `<bin>/<name>.calls` and sleeps for the
//! number of seconds in `<bin>/<name>.delay` (when present) before producing
//! output, so tests can count invocations and hold jobs in `processing`.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const PRELUDE: &str = r#"#!/bin/sh
here=$(dirname "$0")
name=$(basename "$0")
echo "$name" >> "$here/$name.calls"
if [ -f "$here/$name.delay" ]; then sleep "$(cat "$here/$name.delay")"; fi
for last; do :; done
"#;

/// Reports a 60 second container.
pub const FFPROBE: &str = r#"echo "60.000000"
"#;

/// Emits `-progress` output in quarter steps, then writes the last argument.
pub const FFMPEG: &str = r#"for t in 15000000 30000000 45000000 60000000; do
  echo "out_time_us=$t"
  echo "progress=continue"
  sleep 0.05
done
echo "progress=end"
printf 'fake-media' > "$last"
"#;

/// Writes `<outdir>/<stem>.pdf` like the real converter.
pub const SOFFICE: &str = r#"outdir=""
prev=""
for arg; do
  if [ "$prev" = "--outdir" ]; then outdir="$arg"; fi
  prev="$arg"
done
file=$(basename "$last")
printf '%%PDF-1.7 fake' > "$outdir/${file%.*}.pdf"
"#;

/// `-singlefile` output: `<prefix>.png`.
pub const PDFTOPPM: &str = r#"printf 'fake-png' > "$last.png"
"#;

/// Exits non-zero with a message on stderr.
pub const FAILING: &str = r#"echo "conversion exploded on $last" >&2
exit 3
"#;

/// Writes an executable fake named `name` into `bin_dir`.
pub fn install(bin_dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = bin_dir.join(name);
    std::fs::write(&path, format!("{}{}", PRELUDE, body)).expect("Failed to write fake binary");
    let mut perms = std::fs::metadata(&path)
        .expect("Failed to stat fake binary")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("Failed to chmod fake binary");
    path
}

/// How many times the fake named `name` ran.
pub fn calls(bin_dir: &Path, name: &str) -> usize {
    std::fs::read_to_string(bin_dir.join(format!("{}.calls", name)))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

pub fn set_delay(bin_dir: &Path, name: &str, seconds: f32) {
    std::fs::write(bin_dir.join(format!("{}.delay", name)), seconds.to_string())
        .expect("Failed to write delay file");
}
