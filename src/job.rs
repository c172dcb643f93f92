//! The unit of work: one input document and what is known about it up front.

use crate::config::PipelineConfig;
use crate::dedup::ContentHash;
use crate::error::PipelineError;
use once_cell::sync::Lazy;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// PDFs larger than this are not scanned for page objects.
const MAX_PDF_SCAN_BYTES: u64 = 64 * 1024 * 1024;

static APP_SLIDES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(?:\w+:)?Slides>\s*(\d+)\s*</(?:\w+:)?Slides>").unwrap());
static APP_PAGES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(?:\w+:)?Pages>\s*(\d+)\s*</(?:\w+:)?Pages>").unwrap());
static SLIDE_PART_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ppt/slides/slide\d+\.xml$").unwrap());
static PDF_PAGE_RE: Lazy<BytesRegex> =
    Lazy::new(|| BytesRegex::new(r"/Type\s*/Page\b").unwrap());

/// Coarse document classification; decides which stages apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Presentation formats (`.pptx`, `.pptm`, `.ppt`, `.odp`, ...).
    SlideDeck,
    /// Already fixed-layout (`.pdf`); goes straight to rasterisation.
    FixedLayout,
    /// Anything else an office suite can open (`.docx`, `.xlsx`, ...).
    Other,
}

impl DocumentKind {
    /// Classify by file name. Anything unrecognised is [`DocumentKind::Other`].
    pub fn from_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pptx" | "pptm" | "ppt" | "ppsx" | "pps" | "potx" | "odp" | "key" => {
                DocumentKind::SlideDeck
            }
            "pdf" => DocumentKind::FixedLayout,
            _ => DocumentKind::Other,
        }
    }

    /// True for formats that may carry embedded media parts.
    pub fn is_container(self) -> bool {
        !matches!(self, DocumentKind::FixedLayout)
    }

    /// True when a fixed-layout rendition must be produced before rasterising.
    pub fn needs_conversion(self) -> bool {
        !matches!(self, DocumentKind::FixedLayout)
    }
}

/// Page or slide count, when it could be read cheaply from the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageCount {
    Known(usize),
    Unknown,
}

impl PageCount {
    pub fn known(self) -> Option<usize> {
        match self {
            PageCount::Known(n) => Some(n),
            PageCount::Unknown => None,
        }
    }
}

/// One document submitted for processing. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentJob {
    pub source_path: PathBuf,
    /// Name used in logs, warnings, and attachment notes.
    pub display_name: String,
    pub content_hash: ContentHash,
    pub kind: DocumentKind,
    pub page_count: PageCount,
    pub created_at: SystemTime,
}

impl DocumentJob {
    /// Build a job for a local file using the config's fingerprint length.
    pub fn new(path: impl AsRef<Path>, config: &PipelineConfig) -> Result<Self, PipelineError> {
        Self::from_path(path, None, config.hash_prefix_bytes)
    }

    /// Build a job, validating the file is readable.
    ///
    /// `display_name` defaults to the file name. The kind is taken from the
    /// display name's extension (uploads often live under opaque temp names)
    /// and falls back to the path's; a `%PDF` header always means fixed layout.
    pub fn from_path(
        path: impl AsRef<Path>,
        display_name: Option<&str>,
        hash_prefix_bytes: usize,
    ) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(PipelineError::FileNotFound { path });
        }

        let mut magic = [0u8; 4];
        match File::open(&path) {
            Ok(mut f) => {
                // Short files just keep the zeroed buffer.
                let _ = f.read_exact(&mut magic);
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(PipelineError::PermissionDenied { path });
            }
            Err(source) => return Err(PipelineError::Io { path, source }),
        }

        let display_name = display_name
            .map(str::to_string)
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| path.display().to_string());

        let kind = if &magic == b"%PDF" {
            DocumentKind::FixedLayout
        } else {
            match DocumentKind::from_name(&display_name) {
                DocumentKind::Other => DocumentKind::from_name(&path.to_string_lossy()),
                k => k,
            }
        };

        let content_hash = ContentHash::of_file(&path, hash_prefix_bytes).map_err(|source| {
            PipelineError::Io {
                path: path.clone(),
                source,
            }
        })?;
        let page_count = count_pages(&path, kind);
        debug!(
            "Job '{}': kind={:?} pages={:?} hash={}",
            display_name, kind, page_count, content_hash
        );

        Ok(Self {
            source_path: path,
            display_name,
            content_hash,
            kind,
            page_count,
            created_at: SystemTime::now(),
        })
    }
}

/// Best-effort page count. Never fails; unreadable files are `Unknown`.
pub fn count_pages(path: &Path, kind: DocumentKind) -> PageCount {
    let counted = match kind {
        DocumentKind::FixedLayout => count_pdf_pages(path),
        _ => count_container_pages(path),
    };
    match counted {
        Some(n) if n > 0 => PageCount::Known(n),
        _ => PageCount::Unknown,
    }
}

fn count_pdf_pages(path: &Path) -> Option<usize> {
    let len = std::fs::metadata(path).ok()?.len();
    if len > MAX_PDF_SCAN_BYTES {
        return None;
    }
    let bytes = std::fs::read(path).ok()?;
    Some(PDF_PAGE_RE.find_iter(&bytes).count())
}

/// Slide/page count from `docProps/app.xml`, else the number of slide parts.
fn count_container_pages(path: &Path) -> Option<usize> {
    let file = File::open(path).ok()?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).ok()?;

    if let Ok(mut entry) = archive.by_name("docProps/app.xml") {
        let mut xml = String::new();
        if entry.read_to_string(&mut xml).is_ok() {
            for re in [&*APP_SLIDES_RE, &*APP_PAGES_RE] {
                if let Some(n) = re
                    .captures(&xml)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .filter(|&n| n > 0)
                {
                    return Some(n);
                }
            }
        }
    }

    let slides = archive
        .file_names()
        .filter(|name| SLIDE_PART_RE.is_match(name))
        .count();
    (slides > 0).then_some(slides)
}
