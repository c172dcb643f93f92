//! Embedded asset extraction from office containers.
//!
//! OOXML (`.pptx`, `.docx`, `.xlsx`) and ODF files are zip archives; the
//! pictures a user pasted in are stored as ordinary entries under a media
//! folder. Those bytes are the original images at full quality, so they are
//! pulled out directly before anything is rendered. EMF/WMF drawings are
//! collected separately for the vector fallback.

use crate::error::StageError;
use crate::output::ImageArtifact;
use crate::pipeline::encode::detect_mime;
use crate::plan::Stage;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

/// Folders holding embedded media, per container family.
pub const MEDIA_PREFIXES: &[&str] = &["ppt/media/", "word/media/", "xl/media/", "Pictures/"];

const RASTER_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "tif", "tiff"];
const VECTOR_EXTENSIONS: &[&str] = &["emf", "wmf"];

/// Limits for one extraction.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedOptions {
    pub max_images: usize,
    /// Raster entries smaller than this are icons or bullets; skipped.
    pub min_image_bytes: u64,
    /// Entries larger than this are not read at all.
    pub max_entry_bytes: u64,
    /// Zero disables vector collection.
    pub max_vectors: usize,
}

/// An EMF/WMF drawing awaiting conversion.
#[derive(Debug, Clone)]
pub struct VectorAsset {
    /// Entry name inside the container.
    pub name: String,
    pub bytes: Vec<u8>,
    /// Position among the container's vector entries.
    pub ordinal: usize,
}

impl VectorAsset {
    /// Lower-case extension of the entry name (`emf` / `wmf`).
    pub fn extension(&self) -> String {
        extension_of(&self.name)
    }
}

/// Everything pulled from one container.
#[derive(Debug, Default)]
pub struct EmbeddedAssets {
    /// Raster images in container listing order.
    pub images: Vec<ImageArtifact>,
    pub vectors: Vec<VectorAsset>,
    pub skipped_small: usize,
    /// Entries skipped or unreadable, with the reason.
    pub warnings: Vec<String>,
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

fn is_media_entry(name: &str) -> bool {
    MEDIA_PREFIXES.iter().any(|p| name.starts_with(p)) && !name.ends_with('/')
}

/// Extract embedded raster images and vector drawings from `path`.
///
/// A file that is not a readable archive is a [`StageError::CorruptInput`];
/// a single unreadable entry only adds a warning.
pub fn extract_embedded(path: &Path, opts: &EmbeddedOptions) -> Result<EmbeddedAssets, StageError> {
    let file = File::open(path).map_err(|e| StageError::CorruptInput {
        detail: e.to_string(),
    })?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| StageError::CorruptInput {
            detail: format!("not a readable archive: {e}"),
        })?;

    let mut out = EmbeddedAssets::default();
    let mut raster_ordinal = 0usize;

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                out.warnings.push(format!("archive entry {index} unreadable: {e}"));
                continue;
            }
        };
        let name = entry.name().to_string();
        if !is_media_entry(&name) {
            continue;
        }
        let ext = extension_of(&name);
        let is_raster = RASTER_EXTENSIONS.contains(&ext.as_str());
        let is_vector = VECTOR_EXTENSIONS.contains(&ext.as_str());
        if !is_raster && !is_vector {
            continue;
        }
        if is_raster && out.images.len() >= opts.max_images {
            continue;
        }
        if is_vector && out.vectors.len() >= opts.max_vectors {
            continue;
        }

        let size = entry.size();
        if is_raster && size < opts.min_image_bytes {
            debug!("Skipping small media '{}' ({} bytes)", name, size);
            out.skipped_small += 1;
            continue;
        }
        if size > opts.max_entry_bytes {
            warn!("Skipping oversized media '{}' ({} bytes)", name, size);
            out.warnings.push(format!(
                "embedded '{}' skipped: {} bytes exceeds the per-image limit",
                name, size
            ));
            continue;
        }

        let mut bytes = Vec::with_capacity(size as usize);
        if let Err(e) = entry.read_to_end(&mut bytes) {
            out.warnings.push(format!("embedded '{}' unreadable: {}", name, e));
            continue;
        }

        if is_raster {
            let mime = detect_mime(&bytes, &ext);
            out.images.push(
                ImageArtifact::new(bytes, mime, Stage::EmbeddedExtract, raster_ordinal)
                    .with_name(name),
            );
            raster_ordinal += 1;
        } else {
            let ordinal = out.vectors.len();
            out.vectors.push(VectorAsset {
                name,
                bytes,
                ordinal,
            });
        }
    }

    info!(
        "Embedded extraction: {} image(s), {} vector drawing(s), {} icon(s) skipped",
        out.images.len(),
        out.vectors.len(),
        out.skipped_small
    );
    Ok(out)
}
