//! Configuration types for document rasterisation.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Every threshold the pipeline uses to decide
//! whether a stage is worth attempting lives here rather than as a constant
//! in the stage, so a deployment can re-tune them for its own document sizes.
//!
//! # Design choice: builder over constructor
//! Thirty knobs in a constructor are unreadable. The builder lets callers set
//! only what they care about and rely on documented defaults for the rest.

use crate::error::PipelineError;
use crate::progress::PipelineObserver;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one pipeline (shared by every document it processes).
///
/// # Example
/// ```rust
/// use edgequake_docvision::{OutputSchema, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .dpi(200)
///     .max_pages(12)
///     .output_schema(OutputSchema::SourceBlob)
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 200);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    // ── Rendering ────────────────────────────────────────────────────────
    /// Rendering resolution in dots per inch. Range: 72–600. Default: 150.
    ///
    /// 150 DPI keeps slide text legible for a vision model while a 16:9 slide
    /// stays around 2000 px wide. Raise it for spectra or dense charts with
    /// fine axis labels; every doubling roughly quadruples the payload.
    pub dpi: u32,

    /// Longest rendered edge in pixels, independent of DPI. Default: 4000.
    ///
    /// An A0 poster at 300 DPI is 10 000 px wide; this cap keeps one page
    /// from exhausting memory regardless of its physical size.
    pub max_rendered_pixels: u32,

    /// Encoding of rendered pages. Default: [`OutputFormat::Png`].
    pub output_format: OutputFormat,

    /// JPEG quality (1–100) used when `output_format` is lossy. Default: 92.
    pub jpeg_quality: u8,

    /// Maximum pages rendered per document. Default: 30.
    pub max_pages: usize,

    /// Rendering re-checks the global deadline every this many pages. Default: 5.
    pub raster_checkpoint_every: usize,

    // ── Payload limits ───────────────────────────────────────────────────
    /// Maximum raster images pulled straight from the container. Default: 20.
    pub max_embedded_images: usize,

    /// Embedded images below this size are treated as icons. Default: 4 KiB.
    pub min_embedded_image_bytes: u64,

    /// Maximum images in one document's result. Default: 50.
    pub max_image_count: usize,

    /// Cumulative encoded image bytes per document. Default: 64 MiB.
    ///
    /// Checked after each image: the image that crosses the line is kept,
    /// everything after it is not.
    pub max_total_image_bytes: u64,

    /// Any single image above this is dropped. Default: 10 MiB.
    pub max_single_image_bytes: u64,

    // ── Timing ───────────────────────────────────────────────────────────
    /// Fixed part of the converter deadline. Default: 30 s.
    pub base_timeout_secs: u64,

    /// Converter deadline added per page or slide. Default: 3 s.
    pub per_page_timeout_secs: u64,

    /// Upper bound on the converter deadline. Default: 240 s.
    pub max_timeout_secs: u64,

    /// Floor of the rendering-time estimate. Default: 5 s.
    pub min_render_secs: u64,

    /// Estimated rendering time per page. Default: 2 s.
    pub per_page_render_secs: u64,

    /// Wall-clock ceiling for one document. Default: 180 s.
    pub total_processing_budget_secs: u64,

    /// Head-room kept free when deciding to start a stage. Default: 10 s.
    pub safety_margin_secs: u64,

    /// Fraction of a stage's estimated time that must remain before it is
    /// started. Default: 0.8.
    pub attempt_threshold: f64,

    // ── Vector fallback ──────────────────────────────────────────────────
    /// Convert embedded EMF/WMF drawings. Default: true.
    pub enable_vector_fallback: bool,

    /// Deadline for each tool on each vector asset. Default: 10 s.
    pub vector_item_timeout_secs: u64,

    /// Vector conversion only starts with this much time left. Default: 20 s.
    pub vector_min_remaining_secs: u64,

    /// Density passed to the image converter. Default: 150.
    pub vector_density: u32,

    /// Maximum vector assets attempted per document. Default: 10.
    pub max_vector_assets: usize,

    // ── Output ───────────────────────────────────────────────────────────
    /// Content-block shape produced for images. Default: [`OutputSchema::ImageUrl`].
    pub output_schema: OutputSchema,

    /// Detail hint attached to url-style image blocks. Default: [`ImageDetail::High`].
    pub image_detail: ImageDetail,

    /// Extract per-slide text and speaker notes from slide decks. Default: true.
    pub include_slide_text: bool,

    // ── Session ──────────────────────────────────────────────────────────
    /// Bytes read from the start of a file to fingerprint it. Default: 64 KiB.
    pub hash_prefix_bytes: usize,

    // ── Tools ────────────────────────────────────────────────────────────
    /// Explicit tool locations; anything unset is discovered at run time.
    pub tools: ToolPaths,

    /// After a converter timeout, kill leftover processes of the same
    /// family (`pkill -9 -f soffice`). Default: true.
    pub sweep_on_timeout: bool,

    /// Parent of the per-document scratch directories. Default: the system
    /// temp directory.
    pub scratch_root: Option<PathBuf>,

    /// Receives document and stage events.
    pub observer: Option<Arc<dyn PipelineObserver>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_rendered_pixels: 4000,
            output_format: OutputFormat::default(),
            jpeg_quality: 92,
            max_pages: 30,
            raster_checkpoint_every: 5,
            max_embedded_images: 20,
            min_embedded_image_bytes: 4 * 1024,
            max_image_count: 50,
            max_total_image_bytes: 64 * 1024 * 1024,
            max_single_image_bytes: 10 * 1024 * 1024,
            base_timeout_secs: 30,
            per_page_timeout_secs: 3,
            max_timeout_secs: 240,
            min_render_secs: 5,
            per_page_render_secs: 2,
            total_processing_budget_secs: 180,
            safety_margin_secs: 10,
            attempt_threshold: 0.8,
            enable_vector_fallback: true,
            vector_item_timeout_secs: 10,
            vector_min_remaining_secs: 20,
            vector_density: 150,
            max_vector_assets: 10,
            output_schema: OutputSchema::default(),
            image_detail: ImageDetail::default(),
            include_slide_text: true,
            hash_prefix_bytes: 64 * 1024,
            tools: ToolPaths::default(),
            sweep_on_timeout: true,
            scratch_root: None,
            observer: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("dpi", &self.dpi)
            .field("output_format", &self.output_format)
            .field("max_pages", &self.max_pages)
            .field("max_image_count", &self.max_image_count)
            .field("max_total_image_bytes", &self.max_total_image_bytes)
            .field("max_single_image_bytes", &self.max_single_image_bytes)
            .field("total_processing_budget_secs", &self.total_processing_budget_secs)
            .field("attempt_threshold", &self.attempt_threshold)
            .field("enable_vector_fallback", &self.enable_vector_fallback)
            .field("output_schema", &self.output_schema)
            .field("tools", &self.tools)
            .field("scratch_root", &self.scratch_root)
            .field("observer", &self.observer.as_ref().map(|_| "<dyn PipelineObserver>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_secs(self.total_processing_budget_secs)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    pub fn vector_item_timeout(&self) -> Duration {
        Duration::from_secs(self.vector_item_timeout_secs)
    }

    /// The encoding applied to rendered pages.
    pub fn encoding(&self) -> Encoding {
        match self.output_format {
            OutputFormat::Png => Encoding::Png,
            OutputFormat::Jpeg => Encoding::Jpeg {
                quality: self.jpeg_quality,
            },
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n.max(1);
        self
    }

    pub fn raster_checkpoint_every(mut self, n: usize) -> Self {
        self.config.raster_checkpoint_every = n.max(1);
        self
    }

    pub fn max_embedded_images(mut self, n: usize) -> Self {
        self.config.max_embedded_images = n;
        self
    }

    pub fn min_embedded_image_bytes(mut self, bytes: u64) -> Self {
        self.config.min_embedded_image_bytes = bytes;
        self
    }

    pub fn max_image_count(mut self, n: usize) -> Self {
        self.config.max_image_count = n;
        self
    }

    pub fn max_total_image_bytes(mut self, bytes: u64) -> Self {
        self.config.max_total_image_bytes = bytes;
        self
    }

    pub fn max_single_image_bytes(mut self, bytes: u64) -> Self {
        self.config.max_single_image_bytes = bytes;
        self
    }

    pub fn base_timeout_secs(mut self, secs: u64) -> Self {
        self.config.base_timeout_secs = secs;
        self
    }

    pub fn per_page_timeout_secs(mut self, secs: u64) -> Self {
        self.config.per_page_timeout_secs = secs;
        self
    }

    pub fn max_timeout_secs(mut self, secs: u64) -> Self {
        self.config.max_timeout_secs = secs;
        self
    }

    pub fn min_render_secs(mut self, secs: u64) -> Self {
        self.config.min_render_secs = secs;
        self
    }

    pub fn per_page_render_secs(mut self, secs: u64) -> Self {
        self.config.per_page_render_secs = secs;
        self
    }

    pub fn total_processing_budget_secs(mut self, secs: u64) -> Self {
        self.config.total_processing_budget_secs = secs;
        self
    }

    pub fn safety_margin_secs(mut self, secs: u64) -> Self {
        self.config.safety_margin_secs = secs;
        self
    }

    pub fn attempt_threshold(mut self, fraction: f64) -> Self {
        self.config.attempt_threshold = fraction;
        self
    }

    pub fn enable_vector_fallback(mut self, v: bool) -> Self {
        self.config.enable_vector_fallback = v;
        self
    }

    pub fn vector_item_timeout_secs(mut self, secs: u64) -> Self {
        self.config.vector_item_timeout_secs = secs.max(1);
        self
    }

    pub fn vector_min_remaining_secs(mut self, secs: u64) -> Self {
        self.config.vector_min_remaining_secs = secs;
        self
    }

    pub fn vector_density(mut self, density: u32) -> Self {
        self.config.vector_density = density.clamp(36, 600);
        self
    }

    pub fn max_vector_assets(mut self, n: usize) -> Self {
        self.config.max_vector_assets = n;
        self
    }

    pub fn output_schema(mut self, schema: OutputSchema) -> Self {
        self.config.output_schema = schema;
        self
    }

    pub fn image_detail(mut self, detail: ImageDetail) -> Self {
        self.config.image_detail = detail;
        self
    }

    pub fn include_slide_text(mut self, v: bool) -> Self {
        self.config.include_slide_text = v;
        self
    }

    pub fn hash_prefix_bytes(mut self, n: usize) -> Self {
        self.config.hash_prefix_bytes = n.max(1);
        self
    }

    pub fn office_converter(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tools.office_converter = Some(path.into());
        self
    }

    pub fn image_converter(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tools.image_converter = Some(path.into());
        self
    }

    pub fn pdfium_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tools.pdfium_library = Some(path.into());
        self
    }

    pub fn sweep_on_timeout(mut self, v: bool) -> Self {
        self.config.sweep_on_timeout = v;
        self
    }

    pub fn scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = Some(dir.into());
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(PipelineError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if !(c.attempt_threshold > 0.0 && c.attempt_threshold <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "attempt_threshold must be in (0, 1], got {}",
                c.attempt_threshold
            )));
        }
        if c.max_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.max_single_image_bytes == 0 || c.max_total_image_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "image byte limits must be ≥ 1".into(),
            ));
        }
        if c.total_processing_budget_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "total_processing_budget_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Encoding of rendered pages.
///
/// PNG keeps small labels crisp (spectra, axis ticks, footnotes); JPEG is
/// several times smaller and fits far more pages under the byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Lossless. (default)
    #[default]
    Png,
    /// Lossy, with `jpeg_quality`.
    Jpeg,
}

/// Concrete encoding with its parameters resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Png,
    Jpeg { quality: u8 },
}

impl Encoding {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Encoding::Png => "image/png",
            Encoding::Jpeg { .. } => "image/jpeg",
        }
    }
}

/// Shape of the image content blocks handed to the caller.
///
/// The caller knows which downstream API it targets, so it picks the shape
/// once per job; the pipeline never guesses it from a model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSchema {
    /// `{"type":"image_url","image_url":{"url":"data:…","detail":"high"}}` (default)
    #[default]
    ImageUrl,
    /// `{"type":"image","source":{"type":"base64","media_type":"…","data":"…"}}`
    SourceBlob,
}

/// Vision detail hint for url-style blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    /// Full tile budget; small print stays readable. (default)
    #[default]
    High,
    Auto,
}

impl ImageDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageDetail::Low => "low",
            ImageDetail::High => "high",
            ImageDetail::Auto => "auto",
        }
    }
}

/// Explicit locations of the external collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPaths {
    /// Office suite binary (`soffice`). Discovered on PATH when unset.
    pub office_converter: Option<PathBuf>,
    /// Image converter (`magick` / `convert`). Discovered on PATH when unset.
    pub image_converter: Option<PathBuf>,
    /// pdfium shared library. Falls back to `PDFIUM_LIB_PATH`, then the system library.
    pub pdfium_library: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::builder().build().expect("defaults build");
        assert_eq!(config.dpi, 150);
        assert_eq!(config.output_schema, OutputSchema::ImageUrl);
        assert!((config.attempt_threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn dpi_is_clamped() {
        let config = PipelineConfig::builder().dpi(5000).build().unwrap();
        assert_eq!(config.dpi, 600);
        let config = PipelineConfig::builder().dpi(10).build().unwrap();
        assert_eq!(config.dpi, 72);
    }

    #[test]
    fn bad_threshold_rejected() {
        let err = PipelineConfig::builder()
            .attempt_threshold(1.5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("attempt_threshold"));
    }

    #[test]
    fn encoding_follows_format() {
        let config = PipelineConfig::builder()
            .output_format(OutputFormat::Jpeg)
            .jpeg_quality(70)
            .build()
            .unwrap();
        assert_eq!(config.encoding(), Encoding::Jpeg { quality: 70 });
        assert_eq!(config.encoding().mime_type(), "image/jpeg");
    }

    #[test]
    fn schema_serialises_snake_case() {
        let json = serde_json::to_string(&OutputSchema::SourceBlob).unwrap();
        assert_eq!(json, "\"source_blob\"");
    }
}
