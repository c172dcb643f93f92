//! External tool plumbing: discovery, deadline-bounded execution, cleanup.
//!
//! Every external binary the pipeline drives goes through
//! [`run_with_timeout`]. The child is started in its own process group so
//! that a timeout kills the whole tree (office suites fork helper processes
//! that would otherwise outlive the wrapper), and the child is reaped before
//! the call returns.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured output cap per stream.
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Deadline for the cleanup commands themselves.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(1);

/// Length of diagnostic excerpts copied into logs.
pub const DIAGNOSTIC_CHARS: usize = 800;

/// A finished external process.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Why an external process produced no [`ToolOutput`].
#[derive(Debug)]
pub enum RunError {
    /// The binary does not exist or is not executable.
    NotFound,
    /// The deadline passed; the process tree was killed and reaped.
    Timeout { elapsed: Duration },
    Io(std::io::Error),
}

/// Resolve a tool: the explicit path if given, else the first candidate on `PATH`.
pub fn locate(explicit: Option<&Path>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return which::which(path).ok();
    }
    candidates.iter().find_map(|name| which::which(name).ok())
}

/// Run `cmd` to completion or until `limit` elapses.
pub async fn run_with_timeout(cmd: &mut Command, limit: Duration) -> Result<ToolOutput, RunError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    own_process_group(cmd);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => RunError::NotFound,
        _ => RunError::Io(e),
    })?;

    let pid = child.id();
    let mut stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let mut stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    // One deadline covers both the exit and draining the pipes: a helper
    // that inherited stdout keeps the pipe open after the child is gone.
    let deadline = tokio::time::Instant::now() + limit;
    let finished = tokio::time::timeout_at(deadline, async {
        let status = child.wait().await?;
        let stdout = (&mut stdout_task).await.unwrap_or_default();
        let stderr = (&mut stderr_task).await.unwrap_or_default();
        Ok::<_, std::io::Error>((status, stdout, stderr))
    })
    .await;

    match finished {
        Ok(Ok((status, stdout, stderr))) => Ok(ToolOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            elapsed: start.elapsed(),
        }),
        Ok(Err(e)) => Err(RunError::Io(e)),
        Err(_) => {
            if let Some(pid) = pid {
                kill_group(pid);
            }
            if let Err(e) = child.kill().await {
                debug!("kill after timeout: {}", e);
            }
            stdout_task.abort();
            stderr_task.abort();
            Err(RunError::Timeout {
                elapsed: start.elapsed(),
            })
        }
    }
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// SIGKILL every process in the group led by `pgid`.
#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // The group outlives its leader while any helper is still in it.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!(
            "killpg({}) failed: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

/// Force-kill leftover processes whose command line matches any pattern.
///
/// Used after a converter timeout; an orphaned office process keeps its
/// profile lock and blocks the next conversion. Failures are only logged.
pub async fn sweep(patterns: &[&str]) {
    for pattern in patterns {
        let mut cmd = Command::new("pkill");
        cmd.arg("-9")
            .arg("-f")
            .arg(pattern)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match cmd.spawn() {
            Ok(mut child) => {
                if tokio::time::timeout(SWEEP_TIMEOUT, child.wait()).await.is_err() {
                    warn!("pkill -f {} did not finish in {:?}", pattern, SWEEP_TIMEOUT);
                }
            }
            Err(e) => debug!("pkill unavailable: {}", e),
        }
    }
}

/// The first `max_chars` characters of a diagnostic stream, trimmed.
pub fn excerpt(s: &str, max_chars: usize) -> &str {
    let s = s.trim();
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("  héllo  ", 2), "hé");
        assert_eq!(excerpt("short", 800), "short");
    }

    #[test]
    fn locate_missing_explicit_path() {
        assert!(locate(Some(Path::new("/nonexistent/soffice")), &["sh"]).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn locate_on_path() {
        assert!(locate(None, &["definitely-not-a-tool-xyz", "sh"]).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let out = run_with_timeout(&mut cmd, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_process_tree() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30 & sleep 30");
        let start = Instant::now();
        let err = run_with_timeout(&mut cmd, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_covers_helpers_holding_the_pipes() {
        // The shell exits at once; the background sleep keeps stdout open.
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 6 & echo started");
        let start = Instant::now();
        let err = run_with_timeout(&mut cmd, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let mut cmd = Command::new("/nonexistent/tool");
        let err = run_with_timeout(&mut cmd, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound));
    }
}
