//! Vector drawing fallback: EMF/WMF → PNG through an ordered tool chain.
//!
//! Neither EMF nor WMF is accepted by vision models, and no single tool
//! renders every file, so each asset is offered to each converter in turn
//! until one succeeds. Every attempt runs under its own deadline, and the
//! stage stops as soon as the document's remaining time no longer exceeds
//! the configured floor.

use crate::budget::ResourceBudget;
use crate::config::Encoding;
use crate::error::StageError;
use crate::output::ImageArtifact;
use crate::pipeline::convert::OfficeConverter;
use crate::pipeline::embedded::VectorAsset;
use crate::pipeline::encode::{encode_image, sniff_mime};
use crate::pipeline::render::{render_first_page, PageRenderer, RenderOptions};
use crate::plan::Stage;
use crate::tools::{self, RunError, DIAGNOSTIC_CHARS};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Name used in warnings and errors for the image converter.
pub const IMAGE_TOOL: &str = "image converter";

const CANDIDATES: &[&str] = &["magick", "convert"];

/// Rasterises one vector file.
#[async_trait]
pub trait VectorConverter: Send + Sync {
    fn name(&self) -> &str;

    /// Convert `input` to PNG bytes, using `work_dir` for intermediates.
    async fn rasterize(
        &self,
        input: &Path,
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<Vec<u8>, StageError>;
}

// ── ImageMagick ───────────────────────────────────────────────────────────

/// `magick -density N in.emf out.png` (or the legacy `convert`).
#[derive(Debug, Clone)]
pub struct ImageMagickConverter {
    binary: Option<PathBuf>,
    density: u32,
}

impl ImageMagickConverter {
    pub fn new(binary: Option<PathBuf>, density: u32) -> Self {
        Self { binary, density }
    }
}

#[async_trait]
impl VectorConverter for ImageMagickConverter {
    fn name(&self) -> &str {
        "imagemagick"
    }

    async fn rasterize(
        &self,
        input: &Path,
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<Vec<u8>, StageError> {
        let binary = tools::locate(self.binary.as_deref(), CANDIDATES).ok_or_else(|| {
            StageError::ToolUnavailable {
                tool: IMAGE_TOOL.into(),
            }
        })?;
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vector".into());
        let output = work_dir.join(format!("{stem}.png"));

        let mut cmd = Command::new(&binary);
        cmd.arg("-density")
            .arg(self.density.to_string())
            .arg(input)
            .arg(&output);

        let failure = |detail: String| StageError::ToolFailure {
            tool: IMAGE_TOOL.into(),
            detail,
        };
        let result = match tools::run_with_timeout(&mut cmd, timeout).await {
            Ok(result) => result,
            Err(RunError::NotFound) => {
                return Err(StageError::ToolUnavailable {
                    tool: IMAGE_TOOL.into(),
                })
            }
            Err(RunError::Timeout { .. }) => return Err(StageError::timeout(IMAGE_TOOL, timeout)),
            Err(RunError::Io(e)) => return Err(failure(e.to_string())),
        };
        if !result.status.success() {
            return Err(failure(format!(
                "exit {}: {}",
                result.status,
                tools::excerpt(&result.stderr, DIAGNOSTIC_CHARS)
            )));
        }

        let bytes = tokio::fs::read(&output)
            .await
            .map_err(|e| failure(format!("no output: {e}")))?;
        if sniff_mime(&bytes) != Some("image/png") {
            return Err(failure("output is not a PNG".into()));
        }
        Ok(bytes)
    }
}

// ── Office suite ──────────────────────────────────────────────────────────

/// Converts the drawing to PDF with the office suite, then renders page 1.
pub struct OfficeVectorConverter {
    office: Arc<dyn OfficeConverter>,
    renderer: Arc<dyn PageRenderer>,
    render: RenderOptions,
}

impl OfficeVectorConverter {
    pub fn new(
        office: Arc<dyn OfficeConverter>,
        renderer: Arc<dyn PageRenderer>,
        render: RenderOptions,
    ) -> Self {
        Self {
            office,
            renderer,
            render,
        }
    }
}

#[async_trait]
impl VectorConverter for OfficeVectorConverter {
    fn name(&self) -> &str {
        "office"
    }

    async fn rasterize(
        &self,
        input: &Path,
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<Vec<u8>, StageError> {
        let out_dir = work_dir.join("office");
        let pdf = self.office.convert(input, &out_dir, timeout).await?;

        let renderer = Arc::clone(&self.renderer);
        let opts = self.render;
        tokio::task::spawn_blocking(move || {
            let page = render_first_page(renderer.as_ref(), &pdf, &opts)?;
            encode_image(&page, Encoding::Png)
        })
        .await
        .map_err(|e| StageError::RendererUnavailable {
            detail: format!("render task panicked: {e}"),
        })?
    }
}

// ── Chain ─────────────────────────────────────────────────────────────────

/// Result of converting a document's vector assets.
#[derive(Debug, Default)]
pub struct VectorOutcome {
    pub images: Vec<ImageArtifact>,
    pub warnings: Vec<String>,
    /// Assets never attempted because time ran short.
    pub not_attempted: usize,
}

/// Offer each asset to `chain` in order; the first success wins.
///
/// Each attempt is bounded by `per_item` even if the converter ignores its
/// own timeout. Before each asset the document's remaining time is compared
/// with `floor`; once it no longer exceeds it, the remaining assets are
/// left alone.
pub async fn convert_vectors(
    assets: &[VectorAsset],
    chain: &[Arc<dyn VectorConverter>],
    work_dir: &Path,
    per_item: Duration,
    budget: &ResourceBudget,
    floor: Duration,
) -> VectorOutcome {
    let mut out = VectorOutcome::default();

    for (position, asset) in assets.iter().enumerate() {
        if budget.remaining() <= floor {
            out.not_attempted = assets.len() - position;
            out.warnings.push(format!(
                "{} vector graphic(s) not converted: time budget exhausted",
                out.not_attempted
            ));
            break;
        }

        let item_dir = work_dir.join(format!("vector_{}", asset.ordinal));
        let input = item_dir.join(format!("asset_{}.{}", asset.ordinal, asset.extension()));
        if let Err(e) = write_asset(&item_dir, &input, &asset.bytes).await {
            out.warnings
                .push(format!("vector '{}' could not be staged: {}", asset.name, e));
            continue;
        }

        let mut failures = Vec::new();
        let mut converted = None;
        for converter in chain {
            let attempt = tokio::time::timeout(
                per_item,
                converter.rasterize(&input, &item_dir, per_item),
            )
            .await
            .unwrap_or_else(|_| Err(StageError::timeout(converter.name(), per_item)));
            match attempt {
                Ok(bytes) => {
                    debug!(
                        "Vector '{}' converted by {} ({} bytes)",
                        asset.name,
                        converter.name(),
                        bytes.len()
                    );
                    converted = Some(bytes);
                    break;
                }
                Err(e) => {
                    if e.is_timeout() {
                        warn!("Vector '{}': {} timed out", asset.name, converter.name());
                    } else {
                        debug!("Vector '{}': {} failed: {}", asset.name, converter.name(), e);
                    }
                    failures.push(format!("{}: {}", converter.name(), e));
                }
            }
        }

        match converted {
            Some(bytes) => out.images.push(
                ImageArtifact::new(bytes, "image/png", Stage::VectorFallback, asset.ordinal)
                    .with_name(asset.name.clone()),
            ),
            None => {
                let reason = if failures.is_empty() {
                    "no converter configured".to_string()
                } else {
                    failures.join("; ")
                };
                out.warnings
                    .push(format!("vector '{}' dropped: {}", asset.name, reason));
            }
        }
    }

    info!(
        "Vector fallback: {}/{} converted",
        out.images.len(),
        assets.len()
    );
    out
}

async fn write_asset(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, bytes).await
}
