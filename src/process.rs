//! Orchestrator: runs one document through the stages under its budget.
//!
//! Per document:
//!
//! ```text
//! dedup check ─▶ allocate time ─▶ embedded ─▶ convert ─▶ render ─▶ vector ─▶ assemble
//!                                    │           │          │         │
//!                                    └─ each stage gated on time left, failures become warnings
//! ```
//!
//! Stages run strictly one after another. A stage that fails, times out, or
//! is skipped for lack of time never stops the stages after it from running
//! on whatever input is available, and never turns into an `Err`: only
//! problems that prevent any work at all (missing file, no scratch space)
//! are returned as [`PipelineError`]. Documents in a batch are likewise
//! independent; each gets its own `Result`.

use crate::budget::{allocate, ResourceBudget, StopReason, DEFAULT_PAGE_COUNT};
use crate::config::PipelineConfig;
use crate::dedup::DedupIndex;
use crate::error::PipelineError;
use crate::job::{DocumentJob, DocumentKind};
use crate::output::{ImageArtifact, PipelineResult, PipelineStats, TextSection};
use crate::pipeline::assemble::{assemble, AssemblyLimits};
use crate::pipeline::convert::{OfficeConverter, SofficeConverter};
use crate::pipeline::embedded::{self, EmbeddedOptions, VectorAsset};
use crate::pipeline::render::{
    rasterize_document, PageRenderer, PdfiumRenderer, RasterPolicy, RenderOptions,
};
use crate::pipeline::text;
use crate::pipeline::vector::{
    convert_vectors, ImageMagickConverter, OfficeVectorConverter, VectorConverter,
};
use crate::plan::{Gate, SkipReason, Stage, StagePlan};
use crate::progress::PipelineObserver;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A configured pipeline with its external collaborators.
///
/// The defaults are LibreOffice for conversion, pdfium for rendering, and
/// ImageMagick then LibreOffice for vector drawings. Each can be replaced.
///
/// # Example
/// ```rust,no_run
/// use edgequake_docvision::{DedupIndex, DocumentJob, Pipeline, PipelineConfig};
///
/// # async fn run() -> Result<(), edgequake_docvision::PipelineError> {
/// let config = PipelineConfig::default();
/// let pipeline = Pipeline::new(config.clone());
/// let mut session = DedupIndex::new();
///
/// let job = DocumentJob::new("quarterly.pptx", &config)?;
/// let result = pipeline.process(&job, &mut session).await?;
/// println!("{}", result.attachment_note(&config));
/// for w in &result.warnings {
///     eprintln!("warning: {w}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    office: Arc<dyn OfficeConverter>,
    renderer: Arc<dyn PageRenderer>,
    vector_chain: Option<Vec<Arc<dyn VectorConverter>>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("office", &self.office.name())
            .field("renderer", &self.renderer.name())
            .field(
                "vector_chain",
                &self
                    .vector_chain
                    .as_ref()
                    .map(|c| c.iter().map(|v| v.name().to_string()).collect::<Vec<_>>()),
            )
            .finish()
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let office: Arc<dyn OfficeConverter> = Arc::new(SofficeConverter::new(
            config.tools.office_converter.clone(),
            config.sweep_on_timeout,
        ));
        let renderer: Arc<dyn PageRenderer> =
            Arc::new(PdfiumRenderer::new(config.tools.pdfium_library.clone()));
        Self {
            config,
            office,
            renderer,
            vector_chain: None,
        }
    }

    /// Replace the office-to-PDF converter.
    pub fn with_office_converter(mut self, office: Arc<dyn OfficeConverter>) -> Self {
        self.office = office;
        self
    }

    /// Replace the page renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Replace the vector fallback chain. Tools are tried in order.
    pub fn with_vector_chain(mut self, chain: Vec<Arc<dyn VectorConverter>>) -> Self {
        self.vector_chain = Some(chain);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The explicit chain, or ImageMagick then the office suite.
    fn vector_chain(&self) -> Vec<Arc<dyn VectorConverter>> {
        if let Some(chain) = &self.vector_chain {
            return chain.clone();
        }
        vec![
            Arc::new(ImageMagickConverter::new(
                self.config.tools.image_converter.clone(),
                self.config.vector_density,
            )),
            Arc::new(OfficeVectorConverter::new(
                Arc::clone(&self.office),
                Arc::clone(&self.renderer),
                RenderOptions::from_config(&self.config),
            )),
        ]
    }

    /// Build a job for `path` and process it.
    pub async fn process_path(
        &self,
        path: impl AsRef<Path>,
        dedup: &mut DedupIndex,
    ) -> Result<PipelineResult, PipelineError> {
        let job = DocumentJob::new(path, &self.config)?;
        self.process(&job, dedup).await
    }

    /// Process documents one after another. One document's failure never
    /// affects the others.
    pub async fn process_all(
        &self,
        jobs: &[DocumentJob],
        dedup: &mut DedupIndex,
    ) -> Vec<Result<PipelineResult, PipelineError>> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let result = self.process(job, dedup).await;
            if let Err(e) = &result {
                warn!("'{}' failed: {}", job.display_name, e);
            }
            results.push(result);
        }
        results
    }

    /// Run one document through every applicable stage.
    ///
    /// # Errors
    /// Only when nothing can be attempted: the source file has disappeared
    /// or the scratch directory cannot be created. Stage failures are
    /// reported in [`PipelineResult::warnings`].
    pub async fn process(
        &self,
        job: &DocumentJob,
        dedup: &mut DedupIndex,
    ) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        let cfg = &self.config;
        let mut run = RunLog::new(&job.display_name, cfg.observer.clone());
        run.notify(|o, doc| o.on_document_start(doc));

        if !dedup.should_process(job.content_hash) {
            info!(
                "'{}' already processed in this session (hash {}); skipping",
                job.display_name, job.content_hash
            );
            let result = PipelineResult::duplicate(job, started.elapsed());
            run.notify(|o, doc| o.on_document_complete(doc, 0, result.warnings.len()));
            return Ok(result);
        }
        if !job.source_path.exists() {
            return Err(PipelineError::FileNotFound {
                path: job.source_path.clone(),
            });
        }

        let mut budget = ResourceBudget::from_config(cfg).started_at(started);
        let alloc = allocate(job.page_count, cfg);
        let plan = StagePlan::for_kind(job.kind, cfg);
        info!(
            "Processing '{}' ({:?}, {} page(s){}): conversion timeout {}s, render estimate {}s, budget {}s",
            job.display_name,
            job.kind,
            alloc.pages_assumed,
            if alloc.assumed_default { " assumed" } else { "" },
            alloc.conversion_timeout.as_secs(),
            alloc.render_estimate.as_secs(),
            cfg.total_processing_budget_secs
        );
        if alloc.assumed_default {
            debug!(
                "Page count of '{}' unknown; planning with {}",
                job.display_name, DEFAULT_PAGE_COUNT
            );
        }

        let mut scratch = tempfile::Builder::new();
        scratch.prefix("docvision_");
        let scratch = match &cfg.scratch_root {
            Some(root) => scratch.tempdir_in(root),
            None => scratch.tempdir(),
        }
        .map_err(PipelineError::ScratchDir)?;

        // ── Stage 1: embedded extraction ─────────────────────────────────
        let mut embedded_images: Vec<ImageArtifact> = Vec::new();
        let mut vector_assets: Vec<VectorAsset> = Vec::new();
        let mut text_sections: Vec<TextSection> = Vec::new();
        if plan.contains(Stage::EmbeddedExtract) {
            run.start(Stage::EmbeddedExtract);
            let extracted = self.extract(job).await;
            match extracted.assets {
                Ok(assets) => {
                    for image in &assets.images {
                        if image.size_bytes() <= cfg.max_single_image_bytes {
                            budget.charge(image.size_bytes());
                        }
                    }
                    run.warnings.extend(assets.warnings);
                    run.finish(Stage::EmbeddedExtract, assets.images.len(), None);
                    embedded_images = assets.images;
                    vector_assets = assets.vectors;
                }
                Err(e) => run.finish(
                    Stage::EmbeddedExtract,
                    0,
                    Some(format!("embedded image extraction failed: {e}")),
                ),
            }
            match extracted.text {
                Some(Ok(slides)) => {
                    run.warnings.extend(slides.warnings);
                    if slides.truncated {
                        run.warnings.push(format!(
                            "slide text truncated to {} characters",
                            text::MAX_TEXT_CHARS
                        ));
                    }
                    text_sections = slides.sections;
                }
                Some(Err(e)) => run.warn(format!("slide text extraction failed: {e}")),
                None => {}
            }
        }

        // ── Stage 2: conversion to fixed layout ──────────────────────────
        let fixed_layout: Option<PathBuf> = if !job.kind.needs_conversion() {
            Some(job.source_path.clone())
        } else {
            let stage = Stage::ConvertToFixedLayout;
            match plan.gate(stage, budget.remaining(), &alloc, 0) {
                Gate::Run => {
                    run.start(stage);
                    let timeout = alloc.conversion_timeout.min(budget.remaining());
                    let out_dir = scratch.path().join("fixed_layout");
                    match self.office.convert(&job.source_path, &out_dir, timeout).await {
                        Ok(pdf) => {
                            run.finish(stage, 0, None);
                            Some(pdf)
                        }
                        Err(e) => {
                            run.finish(stage, 0, Some(format!("fixed-layout conversion failed: {e}")));
                            None
                        }
                    }
                }
                Gate::Skip(reason) => {
                    run.skip(stage, &reason, time_warning(stage, &reason));
                    None
                }
            }
        };

        // ── Stage 3: rasterisation ───────────────────────────────────────
        let mut pages: Vec<ImageArtifact> = Vec::new();
        let stage = Stage::Rasterize;
        match fixed_layout {
            None => run.skip(stage, &SkipReason::MissingInput, None),
            Some(pdf) => match plan.gate(stage, budget.remaining(), &alloc, 0) {
                Gate::Run => {
                    run.start(stage);
                    let (outcome, charged) = rasterize_document(
                        Arc::clone(&self.renderer),
                        pdf,
                        RenderOptions::from_config(cfg),
                        RasterPolicy::from_config(cfg),
                        budget,
                    )
                    .await;
                    budget = charged;
                    run.warnings.extend(outcome.page_warnings);
                    if let Some(stop) = outcome.stop {
                        let total = outcome
                            .total_pages
                            .map_or_else(String::new, |n| format!(" of {n}"));
                        let msg = format!(
                            "rendering stopped after {} page(s){}: {}",
                            outcome.pages.len(),
                            total,
                            stop
                        );
                        if stop == StopReason::TimeBudget {
                            warn!("'{}': {}", job.display_name, msg);
                        }
                        run.warnings.push(msg);
                    }
                    let failure = outcome
                        .error
                        .map(|e| format!("rasterisation failed: {e}"));
                    run.finish(stage, outcome.pages.len(), failure);
                    pages = outcome.pages;
                }
                Gate::Skip(reason) => run.skip(stage, &reason, time_warning(stage, &reason)),
            },
        }

        // ── Stage 4: vector fallback ─────────────────────────────────────
        let mut vector_images: Vec<ImageArtifact> = Vec::new();
        let stage = Stage::VectorFallback;
        if plan.contains(stage) && !vector_assets.is_empty() {
            let gate = if cfg.enable_vector_fallback {
                plan.gate(stage, budget.remaining(), &alloc, pages.len())
            } else {
                Gate::Skip(SkipReason::Disabled)
            };
            match gate {
                Gate::Run => {
                    run.start(stage);
                    let chain = self.vector_chain();
                    let outcome = convert_vectors(
                        &vector_assets,
                        &chain,
                        &scratch.path().join("vectors"),
                        cfg.vector_item_timeout(),
                        &budget,
                        Duration::from_secs(cfg.vector_min_remaining_secs),
                    )
                    .await;
                    run.warnings.extend(outcome.warnings);
                    run.finish(stage, outcome.images.len(), None);
                    vector_images = outcome.images;
                }
                Gate::Skip(reason) => {
                    let msg = format!(
                        "{} vector graphic(s) not converted: {}",
                        vector_assets.len(),
                        reason
                    );
                    run.skip(stage, &reason, Some(msg));
                }
            }
        }

        // ── Assembly ─────────────────────────────────────────────────────
        let assembly = assemble(
            &text_sections,
            embedded_images,
            pages,
            vector_images,
            &AssemblyLimits::from_config(cfg),
            cfg.output_schema,
            cfg.image_detail,
        );
        run.warnings.extend(assembly.warnings);

        let count = |stage: Stage| {
            assembly
                .images
                .iter()
                .filter(|i| i.source_stage() == stage)
                .count()
        };
        let stats = PipelineStats {
            embedded_images: count(Stage::EmbeddedExtract),
            rendered_pages: count(Stage::Rasterize),
            vector_images: count(Stage::VectorFallback),
            dropped_images: assembly.dropped,
            total_image_bytes: assembly.total_bytes,
            stages_run: std::mem::take(&mut run.stages_run),
            stages_skipped: std::mem::take(&mut run.stages_skipped),
            conversion_timeout_secs: alloc.conversion_timeout.as_secs(),
            pages_assumed: alloc.pages_assumed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        dedup.mark_processed(job.content_hash);
        if let Err(e) = scratch.close() {
            debug!("Scratch cleanup failed: {}", e);
        }

        let result = PipelineResult {
            document: job.display_name.clone(),
            kind: job.kind,
            content_hash: job.content_hash,
            text_sections,
            images: assembly.images,
            blocks: assembly.blocks,
            warnings: std::mem::take(&mut run.warnings),
            stats,
            duplicate: false,
        };
        info!(
            "'{}' done in {}ms: {} image(s), {} bytes, {} text section(s), {} warning(s)",
            result.document,
            result.stats.elapsed_ms,
            result.images.len(),
            result.stats.total_image_bytes,
            result.text_sections.len(),
            result.warnings.len()
        );
        run.notify(|o, doc| o.on_document_complete(doc, result.images.len(), result.warnings.len()));
        Ok(result)
    }

    /// Container extraction on the blocking pool. A panic becomes a stage
    /// failure rather than an error for the document.
    async fn extract(&self, job: &DocumentJob) -> Extracted {
        let path = job.source_path.clone();
        let opts = EmbeddedOptions {
            max_images: self.config.max_embedded_images,
            min_image_bytes: self.config.min_embedded_image_bytes,
            max_entry_bytes: self.config.max_single_image_bytes,
            max_vectors: self.config.max_vector_assets,
        };
        let want_text = self.config.include_slide_text && job.kind == DocumentKind::SlideDeck;
        let task = tokio::task::spawn_blocking(move || Extracted {
            assets: embedded::extract_embedded(&path, &opts),
            text: want_text.then(|| text::extract_slide_text(&path)),
        });
        task.await.unwrap_or_else(|e| Extracted {
            assets: Err(crate::error::StageError::CorruptInput {
                detail: format!("extraction task panicked: {e}"),
            }),
            text: None,
        })
    }
}

struct Extracted {
    assets: Result<embedded::EmbeddedAssets, crate::error::StageError>,
    text: Option<Result<text::SlideText, crate::error::StageError>>,
}

/// A warning for stages skipped because time ran short; other skips are
/// consequences of earlier warnings.
fn time_warning(stage: Stage, reason: &SkipReason) -> Option<String> {
    match reason {
        SkipReason::InsufficientTime { .. } => Some(format!("{stage} skipped: {reason}")),
        _ => None,
    }
}

/// Warnings, stage bookkeeping, and observer calls for one document's run.
struct RunLog {
    document: String,
    observer: Option<Arc<dyn PipelineObserver>>,
    warnings: Vec<String>,
    stages_run: Vec<Stage>,
    stages_skipped: Vec<Stage>,
    stage_started: Instant,
}

impl RunLog {
    fn new(document: &str, observer: Option<Arc<dyn PipelineObserver>>) -> Self {
        Self {
            document: document.to_string(),
            observer,
            warnings: Vec::new(),
            stages_run: Vec::new(),
            stages_skipped: Vec::new(),
            stage_started: Instant::now(),
        }
    }

    fn notify(&self, f: impl FnOnce(&dyn PipelineObserver, &str)) {
        if let Some(o) = &self.observer {
            f(o.as_ref(), &self.document);
        }
    }

    fn warn(&mut self, msg: String) {
        warn!("'{}': {}", self.document, msg);
        self.warnings.push(msg);
    }

    fn start(&mut self, stage: Stage) {
        debug!("'{}': {} started", self.document, stage);
        self.stage_started = Instant::now();
        self.stages_run.push(stage);
        self.notify(|o, doc| o.on_stage_start(doc, stage));
    }

    fn finish(&mut self, stage: Stage, images: usize, failure: Option<String>) {
        let ms = self.stage_started.elapsed().as_millis();
        match &failure {
            Some(msg) => self.warn(msg.clone()),
            None => info!(
                "'{}': {} produced {} image(s) in {}ms",
                self.document, stage, images, ms
            ),
        }
        self.notify(|o, doc| o.on_stage_complete(doc, stage, images, failure.as_deref()));
    }

    fn skip(&mut self, stage: Stage, reason: &SkipReason, warning: Option<String>) {
        info!("'{}': {} skipped: {}", self.document, stage, reason);
        self.stages_skipped.push(stage);
        if let Some(msg) = warning {
            self.warnings.push(msg);
        }
        let reason = reason.to_string();
        self.notify(|o, doc| o.on_stage_skipped(doc, stage, &reason));
    }
}

// ── Free-function entry points ────────────────────────────────────────────

/// Process one document with the default collaborators.
pub async fn process_document(
    job: &DocumentJob,
    config: &PipelineConfig,
    dedup: &mut DedupIndex,
) -> Result<PipelineResult, PipelineError> {
    Pipeline::new(config.clone()).process(job, dedup).await
}

/// Process a batch sequentially with the default collaborators.
pub async fn process_documents(
    jobs: &[DocumentJob],
    config: &PipelineConfig,
    dedup: &mut DedupIndex,
) -> Vec<Result<PipelineResult, PipelineError>> {
    Pipeline::new(config.clone()).process_all(jobs, dedup).await
}

/// Synchronous wrapper around [`process_document`].
///
/// Creates a temporary tokio runtime internally.
pub fn process_document_sync(
    job: &DocumentJob,
    config: &PipelineConfig,
    dedup: &mut DedupIndex,
) -> Result<PipelineResult, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(process_document(job, config, dedup))
}
