//! Output types: image artifacts, text sections, content blocks, and the
//! per-document result.

use crate::config::{ImageDetail, OutputFormat, OutputSchema, PipelineConfig};
use crate::dedup::ContentHash;
use crate::job::{DocumentJob, DocumentKind};
use crate::pipeline::encode::{data_url, to_base64};
use crate::plan::Stage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One image produced by a stage. Immutable once created.
///
/// Serialises as metadata only; the bytes travel in [`ContentBlock`]s.
#[derive(Debug, Clone, Serialize)]
pub struct ImageArtifact {
    #[serde(skip)]
    bytes: Vec<u8>,
    mime_type: String,
    source_stage: Stage,
    size_bytes: u64,
    ordinal: usize,
    name: Option<String>,
}

impl ImageArtifact {
    /// `ordinal` is the 0-based page index for rendered pages and the
    /// asset position for extracted images.
    pub fn new(
        bytes: Vec<u8>,
        mime_type: impl Into<String>,
        source_stage: Stage,
        ordinal: usize,
    ) -> Self {
        let size_bytes = bytes.len() as u64;
        Self {
            bytes,
            mime_type: mime_type.into(),
            source_stage,
            size_bytes,
            ordinal,
            name: None,
        }
    }

    /// Attach the container part name the image came from.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn source_stage(&self) -> Stage {
        self.source_stage
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Render this image as a content block of the requested shape.
    pub fn to_block(&self, schema: OutputSchema, detail: ImageDetail) -> ContentBlock {
        match schema {
            OutputSchema::ImageUrl => ContentBlock::ImageUrl {
                image_url: ImageUrl {
                    url: data_url(&self.mime_type, &self.bytes),
                    detail: Some(detail.as_str().to_string()),
                },
            },
            OutputSchema::SourceBlob => ContentBlock::Image {
                source: ImageSource {
                    kind: "base64".to_string(),
                    media_type: self.mime_type.clone(),
                    data: to_base64(&self.bytes),
                },
            },
        }
    }
}

/// Labelled text pulled from the document (one per slide).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSection {
    /// e.g. `"Slide 3"`.
    pub label: String,
    pub text: String,
}

impl TextSection {
    pub fn to_block(&self) -> ContentBlock {
        ContentBlock::Text {
            text: format!("[{}]\n{}", self.label, self.text),
        }
    }
}

/// A content block in one of the two supported message shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

/// Counters for one document's run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub embedded_images: usize,
    pub rendered_pages: usize,
    pub vector_images: usize,
    /// Images produced by stages but left out of the result.
    pub dropped_images: usize,
    pub total_image_bytes: u64,
    pub stages_run: Vec<Stage>,
    pub stages_skipped: Vec<Stage>,
    /// Converter deadline the run planned with.
    pub conversion_timeout_secs: u64,
    /// Page count the deadline was computed from.
    pub pages_assumed: usize,
    pub elapsed_ms: u64,
}

/// What one document's run produced.
///
/// Stage failures never surface as errors here; they are listed in
/// `warnings`, and the result carries whatever the other stages produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub document: String,
    pub kind: DocumentKind,
    pub content_hash: ContentHash,
    pub text_sections: Vec<TextSection>,
    /// Kept images, in priority order (embedded, then pages, then vectors).
    pub images: Vec<ImageArtifact>,
    /// Text then image blocks, ready to append to a vision-model message.
    pub blocks: Vec<ContentBlock>,
    pub warnings: Vec<String>,
    pub stats: PipelineStats,
    /// True when the document was already processed in this session.
    pub duplicate: bool,
}

impl PipelineResult {
    /// Empty result for a document seen earlier in the session.
    pub fn duplicate(job: &DocumentJob, elapsed: Duration) -> Self {
        Self {
            document: job.display_name.clone(),
            kind: job.kind,
            content_hash: job.content_hash,
            text_sections: Vec::new(),
            images: Vec::new(),
            blocks: Vec::new(),
            warnings: vec![format!(
                "'{}' was already processed in this session; skipped",
                job.display_name
            )],
            stats: PipelineStats {
                elapsed_ms: elapsed.as_millis() as u64,
                ..PipelineStats::default()
            },
            duplicate: true,
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn has_content(&self) -> bool {
        !self.images.is_empty() || !self.text_sections.is_empty()
    }

    /// One-paragraph note telling the model what the attachment contains.
    pub fn attachment_note(&self, config: &PipelineConfig) -> String {
        if self.duplicate {
            return format!(
                "[Attachment '{}' is identical to one already provided above.]",
                self.document
            );
        }
        let s = &self.stats;
        let mut parts = Vec::new();
        if s.rendered_pages > 0 {
            let format = match config.output_format {
                OutputFormat::Png => "PNG",
                OutputFormat::Jpeg => "JPEG",
            };
            parts.push(format!(
                "{} rendered page image(s) at {} DPI as {}",
                s.rendered_pages, config.dpi, format
            ));
        }
        if s.embedded_images > 0 {
            parts.push(format!("{} embedded image(s)", s.embedded_images));
        }
        if s.vector_images > 0 {
            parts.push(format!("{} converted vector graphic(s)", s.vector_images));
        }
        if !self.text_sections.is_empty() {
            parts.push(format!(
                "extracted text from {} section(s)",
                self.text_sections.len()
            ));
        }
        let mut note = if parts.is_empty() {
            format!("[Attachment '{}': no visual content could be extracted.", self.document)
        } else {
            format!("[Attachment '{}': {}.", self.document, parts.join(", "))
        };
        if s.dropped_images > 0 {
            note.push_str(&format!(
                " {} further image(s) omitted to stay within limits.",
                s.dropped_images
            ));
        }
        note.push(']');
        note
    }
}
