//! Error types for the edgequake-docvision library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal for one document**: the pipeline cannot
//!   run at all for this file (missing file, unreadable file, no scratch
//!   directory). Returned as `Err(PipelineError)` from
//!   [`crate::process::Pipeline::process`]. A batch never aborts on it; each
//!   document gets its own `Result`.
//!
//! * [`StageError`]: **Non-fatal**: one stage failed (converter missing,
//!   renderer crashed, archive corrupt) but the document continues with
//!   whatever the other stages produce. Stage errors are turned into
//!   warnings on [`crate::output::PipelineResult`].
//!
//! Hitting a byte or image-count ceiling is not an error at all; it is a
//! normal truncation path reported through [`crate::budget::StopReason`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal errors for a single document.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// Reading the document failed for another reason.
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Run errors ────────────────────────────────────────────────────────
    /// The private scratch directory for this run could not be created.
    #[error("Failed to create scratch directory: {0}")]
    ScratchDir(#[source] std::io::Error),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal failure of one pipeline stage.
///
/// Every variant leaves the document's pipeline running; the orchestrator
/// records `to_string()` as a warning and moves on to the next stage.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StageError {
    /// The external binary could not be located.
    #[error("{tool} not found")]
    ToolUnavailable { tool: String },

    /// The external binary ran past its deadline and was killed.
    #[error("{tool} timed out after {secs}s and was killed")]
    ToolTimeout { tool: String, secs: u64 },

    /// The external binary exited without usable output.
    #[error("{tool} failed: {detail}")]
    ToolFailure { tool: String, detail: String },

    /// The document container could not be read.
    #[error("unreadable document: {detail}")]
    CorruptInput { detail: String },

    /// The in-process page renderer could not be loaded.
    #[error("page renderer unavailable: {detail}")]
    RendererUnavailable { detail: String },

    /// One page failed to render; the remaining pages are still attempted.
    #[error("page {page} could not be rendered: {detail}")]
    PageRender { page: usize, detail: String },

    /// A rendered page could not be encoded.
    #[error("image encoding failed: {detail}")]
    Encode { detail: String },
}

impl StageError {
    pub(crate) fn timeout(tool: impl Into<String>, limit: Duration) -> Self {
        StageError::ToolTimeout {
            tool: tool.into(),
            secs: limit.as_secs(),
        }
    }

    /// True when the error came from a deadline rather than a crash.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::ToolTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_unavailable_display() {
        let e = StageError::ToolUnavailable {
            tool: "converter".into(),
        };
        assert_eq!(e.to_string(), "converter not found");
    }

    #[test]
    fn timeout_display_and_flag() {
        let e = StageError::timeout("soffice", Duration::from_secs(42));
        assert!(e.to_string().contains("42s"), "got: {e}");
        assert!(e.is_timeout());
        assert!(!StageError::CorruptInput {
            detail: "bad zip".into()
        }
        .is_timeout());
    }

    #[test]
    fn file_not_found_display() {
        let e = PipelineError::FileNotFound {
            path: PathBuf::from("/tmp/deck.pptx"),
        };
        assert!(e.to_string().contains("deck.pptx"));
    }
}
