//! Observer trait for per-document and per-stage pipeline events.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::config::PipelineConfigBuilder::observer`] to follow a document
//! through its stages: which ran, which were skipped and why, and how many
//! images each produced.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docvision::{PipelineConfig, PipelineObserver, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct SkipCounter {
//!     skipped: AtomicUsize,
//! }
//!
//! impl PipelineObserver for SkipCounter {
//!     fn on_stage_skipped(&self, _document: &str, stage: Stage, reason: &str) {
//!         self.skipped.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage} skipped: {reason}");
//!     }
//! }
//!
//! let observer = Arc::new(SkipCounter { skipped: AtomicUsize::new(0) });
//! let config = PipelineConfig::builder()
//!     .observer(observer as Arc<dyn PipelineObserver>)
//!     .build()
//!     .unwrap();
//! ```

use crate::plan::Stage;
use std::sync::Arc;

/// Called by the pipeline as it works through a document.
///
/// All methods default to no-ops so implementations override only what
/// they need. Documents are processed one at a time, so calls for one
/// pipeline never overlap; the `Send + Sync` bound lets the observer be
/// shared with other threads of the host application.
pub trait PipelineObserver: Send + Sync {
    /// Called once per document, before the duplicate check.
    fn on_document_start(&self, document: &str) {
        let _ = document;
    }

    /// Called just before a stage begins.
    fn on_stage_start(&self, document: &str, stage: Stage) {
        let _ = (document, stage);
    }

    /// Called when a stage is not started (budget, applicability, missing input).
    fn on_stage_skipped(&self, document: &str, stage: Stage, reason: &str) {
        let _ = (document, stage, reason);
    }

    /// Called when a stage finishes, successfully or not.
    ///
    /// # Arguments
    /// * `images`: images the stage produced
    /// * `error` : the stage's failure, if it failed
    fn on_stage_complete(&self, document: &str, stage: Stage, images: usize, error: Option<&str>) {
        let _ = (document, stage, images, error);
    }

    /// Called once after assembly, or after a duplicate was short-circuited.
    fn on_document_complete(&self, document: &str, images: usize, warnings: usize) {
        let _ = (document, images, warnings);
    }
}

/// A no-op observer, used when none is configured.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type Observer = Arc<dyn PipelineObserver>;
