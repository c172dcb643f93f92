//! Fixed-layout rasterisation: render PDF pages to images under the budget.
//!
//! The page loop is split in two. A [`PageRenderer`] opens a document and
//! hands pages, in order, to a [`PageVisitor`]; the visitor decides before
//! each page whether to keep going. [`rasterize`] supplies the visitor that
//! enforces the page limit, the wall-clock checkpoints, and the byte and
//! count ceilings, so the same policy runs against pdfium or a test double.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and CPU-bound rendering.
//! [`rasterize_document`] runs the whole loop on Tokio's blocking pool so the
//! async workers never stall.

use crate::budget::{ResourceBudget, StopReason};
use crate::config::{Encoding, PipelineConfig};
use crate::error::StageError;
use crate::output::ImageArtifact;
use crate::pipeline::encode::encode_image;
use crate::plan::Stage;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolution settings handed to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub dpi: u32,
    /// Longest edge in pixels, whatever the DPI works out to.
    pub max_pixels: u32,
}

impl RenderOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
        }
    }
}

/// Receives pages from a [`PageRenderer`], one at a time, in page order.
pub trait PageVisitor {
    /// Called before page `index` (0-based) is rendered. `Break` stops the
    /// loop without rendering it.
    fn before_page(&mut self, index: usize, total: usize) -> ControlFlow<()>;

    /// Called with the rendered page, or the reason it failed.
    fn on_page(&mut self, index: usize, page: Result<DynamicImage, StageError>) -> ControlFlow<()>;
}

/// In-process renderer for fixed-layout documents.
pub trait PageRenderer: Send + Sync {
    fn name(&self) -> &str;

    /// Open `path` and feed its pages to `visitor` until the visitor stops
    /// or the pages run out. Returns the document's page count.
    ///
    /// An `Err` means the document could not be opened at all; per-page
    /// failures go to [`PageVisitor::on_page`].
    fn render_pages(
        &self,
        path: &Path,
        opts: &RenderOptions,
        visitor: &mut dyn PageVisitor,
    ) -> Result<usize, StageError>;
}

/// Standard page loop shared by renderer implementations.
pub fn drive_pages(
    total: usize,
    visitor: &mut dyn PageVisitor,
    mut render: impl FnMut(usize) -> Result<DynamicImage, StageError>,
) {
    for index in 0..total {
        if visitor.before_page(index, total).is_break() {
            break;
        }
        if visitor.on_page(index, render(index)).is_break() {
            break;
        }
    }
}

// ── pdfium ────────────────────────────────────────────────────────────────

/// Renders PDFs through the pdfium shared library.
///
/// The library is bound per document: an explicit path first, then
/// `PDFIUM_LIB_PATH`, then the platform's default library search.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRenderer {
    library: Option<PathBuf>,
}

impl PdfiumRenderer {
    pub fn new(library: Option<PathBuf>) -> Self {
        Self { library }
    }

    fn bind(&self) -> Result<Pdfium, StageError> {
        let explicit = self
            .library
            .clone()
            .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));
        let bindings = match &explicit {
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        };
        bindings.map(Pdfium::new).map_err(|e| StageError::RendererUnavailable {
            detail: match explicit {
                Some(path) => format!("{} ({})", e, path.display()),
                None => e.to_string(),
            },
        })
    }
}

impl PageRenderer for PdfiumRenderer {
    fn name(&self) -> &str {
        "pdfium"
    }

    fn render_pages(
        &self,
        path: &Path,
        opts: &RenderOptions,
        visitor: &mut dyn PageVisitor,
    ) -> Result<usize, StageError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| StageError::CorruptInput {
                detail: format!("{:?}", e),
            })?;

        let pages = document.pages();
        let total = pages.len() as usize;
        info!("PDF loaded: {} pages", total);

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(opts.dpi as f32 / 72.0)
            .set_maximum_width(opts.max_pixels as i32)
            .set_maximum_height(opts.max_pixels as i32);

        drive_pages(total, visitor, |idx| {
            let page = pages.get(idx as u16).map_err(|e| StageError::PageRender {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| StageError::PageRender {
                    page: idx + 1,
                    detail: format!("{:?}", e),
                })?;
            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            Ok(image)
        });

        Ok(total)
    }
}

// ── Budgeted rasterisation ────────────────────────────────────────────────

/// Limits applied while rendering one document.
#[derive(Debug, Clone, Copy)]
pub struct RasterPolicy {
    pub max_pages: usize,
    pub encoding: Encoding,
    /// Wall-clock is re-checked before every `checkpoint_every`-th page.
    pub checkpoint_every: usize,
    /// Rendering stops once no more than this much time is left.
    pub safety_margin: Duration,
    pub max_single_image_bytes: u64,
}

impl RasterPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_pages: config.max_pages,
            encoding: config.encoding(),
            checkpoint_every: config.raster_checkpoint_every.max(1),
            safety_margin: config.safety_margin(),
            max_single_image_bytes: config.max_single_image_bytes,
        }
    }
}

/// What a rasterisation run produced and why it stopped.
#[derive(Debug, Default)]
pub struct RasterOutcome {
    /// Encoded pages in ascending page order.
    pub pages: Vec<ImageArtifact>,
    /// Page count reported by the renderer, when the document opened.
    pub total_pages: Option<usize>,
    /// Set when a limit ended the run early.
    pub stop: Option<StopReason>,
    /// Per-page problems (render or encode failures, oversized pages).
    pub page_warnings: Vec<String>,
    /// Set when the document could not be rendered at all.
    pub error: Option<StageError>,
}

impl RasterOutcome {
    fn failed(error: StageError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

struct Rasterizer<'a> {
    policy: &'a RasterPolicy,
    budget: &'a mut ResourceBudget,
    outcome: RasterOutcome,
}

impl PageVisitor for Rasterizer<'_> {
    fn before_page(&mut self, index: usize, _total: usize) -> ControlFlow<()> {
        if index >= self.policy.max_pages {
            self.outcome.stop = Some(StopReason::PageLimit);
            return ControlFlow::Break(());
        }
        if let Some(reason) = self.budget.limit_reached() {
            self.outcome.stop = Some(reason);
            return ControlFlow::Break(());
        }
        if index > 0
            && index % self.policy.checkpoint_every == 0
            && self.budget.remaining() <= self.policy.safety_margin
        {
            debug!(
                "Time checkpoint at page {}: {:.1}s left",
                index + 1,
                self.budget.remaining().as_secs_f64()
            );
            self.outcome.stop = Some(StopReason::TimeBudget);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn on_page(&mut self, index: usize, page: Result<DynamicImage, StageError>) -> ControlFlow<()> {
        let bytes = match page.and_then(|img| encode_image(&img, self.policy.encoding)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Page {}: {}", index + 1, e);
                self.outcome.page_warnings.push(e.to_string());
                return ControlFlow::Continue(());
            }
        };

        let size = bytes.len() as u64;
        if size > self.policy.max_single_image_bytes {
            warn!(
                "Page {} encoded to {} bytes, over the {} byte limit; dropped",
                index + 1,
                size,
                self.policy.max_single_image_bytes
            );
            self.outcome.page_warnings.push(format!(
                "page {} dropped: {} bytes exceeds the per-image limit of {} bytes",
                index + 1,
                size,
                self.policy.max_single_image_bytes
            ));
            return ControlFlow::Continue(());
        }

        self.outcome.pages.push(
            ImageArtifact::new(bytes, self.policy.encoding.mime_type(), Stage::Rasterize, index)
                .with_name(format!("page-{}", index + 1)),
        );
        match self.budget.charge(size) {
            Some(reason) => {
                self.outcome.stop = Some(reason);
                ControlFlow::Break(())
            }
            None => ControlFlow::Continue(()),
        }
    }
}

/// Render `path` page by page, charging every kept page to `budget`.
///
/// Never fails: a document that cannot be opened yields an outcome with
/// `error` set, and a failure partway through keeps the pages already made.
pub fn rasterize(
    renderer: &dyn PageRenderer,
    path: &Path,
    opts: &RenderOptions,
    policy: &RasterPolicy,
    budget: &mut ResourceBudget,
) -> RasterOutcome {
    let mut visitor = Rasterizer {
        policy,
        budget,
        outcome: RasterOutcome::default(),
    };
    let result = renderer.render_pages(path, opts, &mut visitor);
    let mut outcome = visitor.outcome;
    match result {
        Ok(total) => outcome.total_pages = Some(total),
        Err(e) => outcome.error = Some(e),
    }
    outcome
}

/// [`rasterize`] on the blocking pool. The budget travels with the task and
/// comes back charged.
pub async fn rasterize_document(
    renderer: Arc<dyn PageRenderer>,
    path: PathBuf,
    opts: RenderOptions,
    policy: RasterPolicy,
    budget: ResourceBudget,
) -> (RasterOutcome, ResourceBudget) {
    let fallback = budget.clone();
    let task = tokio::task::spawn_blocking(move || {
        let mut budget = budget;
        let outcome = rasterize(renderer.as_ref(), &path, &opts, &policy, &mut budget);
        (outcome, budget)
    });
    match task.await {
        Ok(done) => done,
        Err(e) => (
            RasterOutcome::failed(StageError::RendererUnavailable {
                detail: format!("render task panicked: {}", e),
            }),
            fallback,
        ),
    }
}

/// Render only the first page of `path`.
pub fn render_first_page(
    renderer: &dyn PageRenderer,
    path: &Path,
    opts: &RenderOptions,
) -> Result<DynamicImage, StageError> {
    struct FirstPage(Option<Result<DynamicImage, StageError>>);

    impl PageVisitor for FirstPage {
        fn before_page(&mut self, index: usize, _total: usize) -> ControlFlow<()> {
            if index == 0 {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        }

        fn on_page(&mut self, _index: usize, page: Result<DynamicImage, StageError>) -> ControlFlow<()> {
            self.0 = Some(page);
            ControlFlow::Break(())
        }
    }

    let mut first = FirstPage(None);
    renderer.render_pages(path, opts, &mut first)?;
    first.0.unwrap_or_else(|| {
        Err(StageError::CorruptInput {
            detail: "document has no pages".into(),
        })
    })
}
