//! Payload assembly: merge stage outputs under the size limits.
//!
//! Images are considered in priority order: embedded originals first, then
//! rendered pages in page order, then converted vector drawings. Any single
//! image over the per-image limit is dropped on its own; the count and byte
//! limits truncate the tail, so whatever survives is always a prefix of the
//! priority order.

use crate::config::{ImageDetail, OutputSchema, PipelineConfig};
use crate::output::{ContentBlock, ImageArtifact, TextSection};
use tracing::{debug, warn};

/// Limits applied to the final image set.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyLimits {
    pub max_images: usize,
    pub max_total_bytes: u64,
    pub max_single_bytes: u64,
}

impl AssemblyLimits {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_images: config.max_image_count,
            max_total_bytes: config.max_total_image_bytes,
            max_single_bytes: config.max_single_image_bytes,
        }
    }
}

/// The assembled payload.
#[derive(Debug, Default)]
pub struct Assembly {
    pub images: Vec<ImageArtifact>,
    /// Text blocks first, then one block per kept image.
    pub blocks: Vec<ContentBlock>,
    pub warnings: Vec<String>,
    /// Images left out for any reason.
    pub dropped: usize,
    pub total_bytes: u64,
}

/// Merge text and the three image streams into the final payload.
pub fn assemble(
    text: &[TextSection],
    embedded: Vec<ImageArtifact>,
    pages: Vec<ImageArtifact>,
    vectors: Vec<ImageArtifact>,
    limits: &AssemblyLimits,
    schema: OutputSchema,
    detail: ImageDetail,
) -> Assembly {
    let mut out = Assembly::default();
    let mut truncated_by: Option<&'static str> = None;
    let mut truncated = 0usize;

    for artifact in embedded.into_iter().chain(pages).chain(vectors) {
        if truncated_by.is_some() {
            truncated += 1;
            continue;
        }
        if artifact.size_bytes() > limits.max_single_bytes {
            let label = artifact
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} #{}", artifact.source_stage(), artifact.ordinal() + 1));
            warn!(
                "Dropping '{}': {} bytes over the {} byte limit",
                label,
                artifact.size_bytes(),
                limits.max_single_bytes
            );
            out.warnings.push(format!(
                "image '{}' dropped: {} bytes exceeds the per-image limit of {} bytes",
                label,
                artifact.size_bytes(),
                limits.max_single_bytes
            ));
            out.dropped += 1;
            continue;
        }
        if out.images.len() >= limits.max_images {
            truncated_by = Some("image count limit");
            truncated += 1;
            continue;
        }

        out.total_bytes += artifact.size_bytes();
        out.images.push(artifact);
        if out.total_bytes > limits.max_total_bytes {
            truncated_by = Some("image byte budget");
        }
    }

    if truncated > 0 {
        let reason = truncated_by.unwrap_or("limits");
        out.warnings.push(format!(
            "{} image(s) omitted: {} reached",
            truncated, reason
        ));
        out.dropped += truncated;
    }

    out.blocks = text
        .iter()
        .map(TextSection::to_block)
        .chain(out.images.iter().map(|img| img.to_block(schema, detail)))
        .collect();

    debug!(
        "Assembled {} image(s), {} bytes, {} dropped",
        out.images.len(),
        out.total_bytes,
        out.dropped
    );
    out
}
