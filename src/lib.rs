//! # edgequake-docvision
//!
//! Turn office documents and PDFs into a bounded set of images for
//! vision-capable models.
//!
//! ## Why this crate?
//!
//! A slide deck or report is mostly pictures: charts, diagrams, screenshots.
//! Handing a model only the extracted text loses all of that, while handing
//! it every page at full resolution blows through request size limits and
//! can take minutes on a large deck. This crate does the middle thing: it
//! pulls out embedded originals, renders pages, and converts vector drawings,
//! all under a per-document time, byte, and image-count budget, and it
//! degrades instead of failing when a tool is missing or hangs.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 0. Dedup     skip content already processed this session
//!  ├─ 1. Embedded  original images (+ EMF/WMF, slide text) from the container
//!  ├─ 2. Convert   office → PDF, deadline scaled by page count
//!  ├─ 3. Render    PDF pages → PNG/JPEG via pdfium (spawn_blocking)
//!  ├─ 4. Vector    EMF/WMF → PNG through a fallback chain
//!  └─ 5. Assemble  priority order, hard limits, content blocks + warnings
//! ```
//!
//! Each stage is gated on the time left; a stage that cannot finish in time
//! is skipped with a warning rather than started.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docvision::{process_document, DedupIndex, DocumentJob, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .total_processing_budget_secs(120)
//!         .max_image_count(20)
//!         .build()?;
//!     let mut session = DedupIndex::new();
//!
//!     let job = DocumentJob::new("roadmap.pptx", &config)?;
//!     let result = process_document(&job, &config, &mut session).await?;
//!     println!("{} image(s)", result.images.len());
//!     for w in &result.warnings {
//!         eprintln!("warning: {w}");
//!     }
//!     let payload = serde_json::to_string(&result.blocks)?;
//!     println!("{} bytes of content blocks", payload.len());
//!     Ok(())
//! }
//! ```
//!
//! ## External Tools
//!
//! | Tool | Used for | When missing |
//! |------|----------|--------------|
//! | `soffice` / `libreoffice` | office → PDF, vector fallback | embedded images only |
//! | pdfium library | page rendering | no rendered pages |
//! | `magick` / `convert` | EMF/WMF → PNG | office fallback is tried |
//!
//! Paths can be pinned through [`PipelineConfigBuilder`]; otherwise `PATH`
//! and `PDFIUM_LIB_PATH` are searched.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod budget;
pub mod config;
pub mod dedup;
pub mod error;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod plan;
pub mod process;
pub mod progress;
pub mod tools;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use budget::{allocate, ResourceBudget, StopReason, TimeAllocation};
pub use config::{
    Encoding, ImageDetail, OutputFormat, OutputSchema, PipelineConfig, PipelineConfigBuilder,
    ToolPaths,
};
pub use dedup::{ContentHash, DedupIndex};
pub use error::{PipelineError, StageError};
pub use job::{DocumentJob, DocumentKind, PageCount};
pub use output::{ContentBlock, ImageArtifact, PipelineResult, PipelineStats, TextSection};
pub use pipeline::convert::OfficeConverter;
pub use pipeline::render::{PageRenderer, PageVisitor};
pub use pipeline::vector::VectorConverter;
pub use plan::{Gate, SkipReason, Stage, StagePlan};
pub use process::{process_document, process_document_sync, process_documents, Pipeline};
pub use progress::{NoopObserver, PipelineObserver};
