//! Office document → PDF through an external office suite.
//!
//! The converter is the slowest and least predictable collaborator: it can
//! hang on a malformed deck, leave helper processes behind, or exit non-zero
//! after writing a perfectly good PDF. [`SofficeConverter`] therefore runs
//! under a hard deadline, uses a throw-away user profile per call, and looks
//! for output regardless of the exit status.

use crate::error::StageError;
use crate::tools::{self, RunError, DIAGNOSTIC_CHARS};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Name used in warnings and errors for the office suite.
pub const OFFICE_TOOL: &str = "office converter";

const CANDIDATES: &[&str] = &["soffice", "libreoffice"];
const SWEEP_PATTERNS: &[&str] = &["soffice", "libreoffice"];

/// Produces a fixed-layout rendition of an office document.
#[async_trait]
pub trait OfficeConverter: Send + Sync {
    fn name(&self) -> &str;

    /// Convert `input` into a PDF inside `out_dir` within `timeout`.
    ///
    /// `out_dir` is created if needed and should be private to this call.
    async fn convert(
        &self,
        input: &Path,
        out_dir: &Path,
        timeout: Duration,
    ) -> Result<PathBuf, StageError>;
}

/// LibreOffice headless conversion.
#[derive(Debug, Clone)]
pub struct SofficeConverter {
    binary: Option<PathBuf>,
    sweep_on_timeout: bool,
}

impl SofficeConverter {
    /// `binary` overrides discovery of `soffice` / `libreoffice` on `PATH`.
    pub fn new(binary: Option<PathBuf>, sweep_on_timeout: bool) -> Self {
        Self {
            binary,
            sweep_on_timeout,
        }
    }

    pub fn is_available(&self) -> bool {
        tools::locate(self.binary.as_deref(), CANDIDATES).is_some()
    }
}

#[async_trait]
impl OfficeConverter for SofficeConverter {
    fn name(&self) -> &str {
        "soffice"
    }

    async fn convert(
        &self,
        input: &Path,
        out_dir: &Path,
        timeout: Duration,
    ) -> Result<PathBuf, StageError> {
        let binary = tools::locate(self.binary.as_deref(), CANDIDATES).ok_or_else(|| {
            StageError::ToolUnavailable {
                tool: OFFICE_TOOL.into(),
            }
        })?;

        let failure = |detail: String| StageError::ToolFailure {
            tool: OFFICE_TOOL.into(),
            detail,
        };
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| failure(format!("cannot create output dir: {e}")))?;
        let profile = tempfile::Builder::new()
            .prefix("lo_profile_")
            .tempdir_in(out_dir)
            .map_err(|e| failure(format!("cannot create profile dir: {e}")))?;

        let mut cmd = Command::new(&binary);
        cmd.arg("--headless")
            .arg("--nologo")
            .arg("--nofirststartwizard")
            .arg("--norestore")
            .arg(format!(
                "-env:UserInstallation=file://{}",
                profile.path().display()
            ))
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(out_dir)
            .arg(input)
            .env("HOME", profile.path());

        info!(
            "Converting '{}' with {} (timeout {}s)",
            input.display(),
            binary.display(),
            timeout.as_secs()
        );

        let output = match tools::run_with_timeout(&mut cmd, timeout).await {
            Ok(output) => output,
            Err(RunError::NotFound) => {
                return Err(StageError::ToolUnavailable {
                    tool: OFFICE_TOOL.into(),
                })
            }
            Err(RunError::Timeout { elapsed }) => {
                warn!(
                    "Conversion of '{}' timed out after {:.1}s; killed",
                    input.display(),
                    elapsed.as_secs_f64()
                );
                if self.sweep_on_timeout {
                    tools::sweep(SWEEP_PATTERNS).await;
                }
                return Err(StageError::timeout(OFFICE_TOOL, timeout));
            }
            Err(RunError::Io(e)) => return Err(failure(e.to_string())),
        };

        info!(
            "Conversion finished in {:.1}s ({})",
            output.elapsed.as_secs_f64(),
            output.status
        );
        if !output.status.success() {
            warn!("{} returned {}", binary.display(), output.status);
            let stderr = tools::excerpt(&output.stderr, DIAGNOSTIC_CHARS);
            if !stderr.is_empty() {
                warn!("stderr: {}", stderr);
            }
            let stdout = tools::excerpt(&output.stdout, DIAGNOSTIC_CHARS);
            if !stdout.is_empty() {
                warn!("stdout: {}", stdout);
            }
        }

        discover_output(input, out_dir).ok_or_else(|| {
            failure(format!(
                "no PDF produced (exit {})",
                output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string())
            ))
        })
    }
}

/// `<stem>.pdf` in `out_dir`, else any PDF there.
pub fn discover_output(input: &Path, out_dir: &Path) -> Option<PathBuf> {
    if let Some(stem) = input.file_stem() {
        let mut name = stem.to_os_string();
        name.push(".pdf");
        let expected = out_dir.join(name);
        if expected.is_file() {
            return Some(expected);
        }
    }
    let mut found: Vec<PathBuf> = std::fs::read_dir(out_dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
        })
        .collect();
    found.sort();
    found.into_iter().next()
}
