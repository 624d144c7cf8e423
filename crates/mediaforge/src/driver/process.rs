//! Scoped subprocess handling for the conversion drivers.
//!
//! Every child is spawned with `kill_on_drop(true)` and awaited on every
//! path out of [`ScopedProcess::stream`]: normal exit, I/O failure and the
//! deadline. When the owning task is aborted instead, dropping the child
//! kills it and tokio reaps it in the background.

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use crate::error::DriverError;
use crate::sanitize::scrub_directory;

const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_CHARS: usize = 2000;

/// Short program name used in errors and logs.
pub fn program_name(program: &Path) -> String {
    program
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("subprocess")
        .to_string()
}

pub struct ScopedProcess {
    program: PathBuf,
    args: Vec<OsString>,
    deadline: Instant,
    scrub: Vec<PathBuf>,
}

impl ScopedProcess {
    pub fn new(program: impl AsRef<Path>, deadline: Instant) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            deadline,
            scrub: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Strips the directory of `path` from stderr excerpts kept in errors.
    pub fn scrub(mut self, path: &Path) -> Self {
        self.scrub.push(path.to_path_buf());
        self
    }

    /// Runs to completion and returns stdout.
    pub async fn output(self) -> Result<String, DriverError> {
        let mut stdout = String::new();
        self.stream(|line| {
            stdout.push_str(line);
            stdout.push('\n');
        })
        .await?;
        Ok(stdout)
    }

    /// Runs to completion, handing every stdout line to `on_line` as it
    /// arrives.
    pub async fn stream<F>(self, mut on_line: F) -> Result<(), DriverError>
    where
        F: FnMut(&str),
    {
        let name = program_name(&self.program);
        let started = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("Spawning {} with {} args", name, self.args.len());

        let mut child = cmd.spawn().map_err(|e| DriverError::Spawn {
            program: name.clone(),
            source: e,
        })?;

        let stderr_task = child.stderr.take().map(|s| tokio::spawn(collect_tail(s)));
        let stdout = child.stdout.take();

        let run = tokio::time::timeout_at(self.deadline, async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    on_line(&line);
                }
            }
            child.wait().await
        })
        .await;

        let status = match run {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(DriverError::Io {
                    program: name,
                    source: e,
                });
            }
            Err(_) => {
                // `kill` also waits, so the child is reaped before we return.
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill timed out {}: {}", name, e);
                }
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(DriverError::Timeout {
                    program: name,
                    after: self.deadline.saturating_duration_since(started),
                });
            }
        };

        if status.success() {
            if let Some(task) = stderr_task {
                task.abort();
            }
            return Ok(());
        }

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = self
            .scrub
            .iter()
            .fold(stderr, |text, path| scrub_directory(&text, path));

        Err(DriverError::ProcessFailure {
            program: name,
            exit_code: status.code(),
            stderr,
        })
    }
}

/// Reads a stream to the end, keeping only a bounded tail.
async fn collect_tail<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    truncate_front(&Vec::from(tail).join("\n"), STDERR_TAIL_CHARS)
}

fn truncate_front(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max_chars).collect();
    format!("…{}", skipped)
}
