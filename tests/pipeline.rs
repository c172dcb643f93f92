//! Integration tests for the document pipeline.
//!
//! Most tests swap the external tools for in-process fakes so they run
//! anywhere. The pdfium test needs the library and is gated behind
//! `PDFIUM_LIB_PATH`:
//!
//!   PDFIUM_LIB_PATH=/path/to/libpdfium.so cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use edgequake_docvision::pipeline::render::{drive_pages, RenderOptions};
use edgequake_docvision::{
    DedupIndex, DocumentJob, DocumentKind, OfficeConverter, PageCount, PageRenderer, PageVisitor,
    Pipeline, PipelineConfig, PipelineObserver, Stage, StageError, VectorConverter,
};
use image::{DynamicImage, Rgb, RgbImage};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use zip::write::SimpleFileOptions;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Skip this test unless `PDFIUM_LIB_PATH` points at a library.
macro_rules! skip_unless_pdfium {
    () => {{
        match std::env::var("PDFIUM_LIB_PATH") {
            Ok(p) if Path::new(&p).exists() => PathBuf::from(p),
            _ => {
                println!("SKIP — set PDFIUM_LIB_PATH to run pdfium tests");
                return;
            }
        }
    }};
}

/// `RUST_LOG=edgequake_docvision=debug` shows the stage log while debugging.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn write_deck(dir: &Path, name: &str, entries: &[(&str, Vec<u8>)]) -> PathBuf {
    let path = dir.join(name);
    let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
    for (entry, data) in entries {
        zip.start_file(*entry, SimpleFileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
    path
}

fn slide(text: &str) -> Vec<u8> {
    format!(
        r#"<p:sld xmlns:a="a" xmlns:p="p"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{text}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>"#
    )
    .into_bytes()
}

fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    noise(w, h)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Incompressible pixels so encoded sizes track dimensions.
fn noise(w: u32, h: u32) -> DynamicImage {
    let mut seed: u32 = 0x2545_F491;
    DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |_, _| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let b = seed.to_le_bytes();
        Rgb([b[0], b[1], b[2]])
    }))
}

/// A PDF whose page count the job can read; the fake renderer ignores it.
fn write_pdf(dir: &Path, pages: usize) -> PathBuf {
    let path = dir.join("report.pdf");
    let mut body = String::from("%PDF-1.4\n");
    for _ in 0..pages {
        body.push_str("<< /Type /Page >>\n");
    }
    std::fs::write(&path, body).unwrap();
    path
}

fn base_config() -> edgequake_docvision::PipelineConfigBuilder {
    PipelineConfig::builder()
        .min_embedded_image_bytes(16)
        .sweep_on_timeout(false)
}

struct FakeRenderer {
    pages: Vec<(u32, u32)>,
}

impl PageRenderer for FakeRenderer {
    fn name(&self) -> &str {
        "fake"
    }

    fn render_pages(
        &self,
        _path: &Path,
        _opts: &RenderOptions,
        visitor: &mut dyn PageVisitor,
    ) -> Result<usize, StageError> {
        drive_pages(self.pages.len(), visitor, |i| {
            let (w, h) = self.pages[i];
            Ok(noise(w, h))
        });
        Ok(self.pages.len())
    }
}

/// Writes a placeholder PDF next to where a real converter would.
struct StubConverter;

#[async_trait]
impl OfficeConverter for StubConverter {
    fn name(&self) -> &str {
        "stub"
    }

    async fn convert(&self, input: &Path, out_dir: &Path, _: Duration) -> Result<PathBuf, StageError> {
        std::fs::create_dir_all(out_dir).unwrap();
        let pdf = out_dir.join(format!(
            "{}.pdf",
            input.file_stem().unwrap().to_string_lossy()
        ));
        std::fs::write(&pdf, b"%PDF-1.4\n").unwrap();
        Ok(pdf)
    }
}

/// Leaves a partial file behind, then fails.
struct CrashingConverter;

#[async_trait]
impl OfficeConverter for CrashingConverter {
    fn name(&self) -> &str {
        "crashing"
    }

    async fn convert(&self, _: &Path, out_dir: &Path, _: Duration) -> Result<PathBuf, StageError> {
        std::fs::create_dir_all(out_dir).unwrap();
        std::fs::write(out_dir.join("partial.pdf.tmp"), b"%PDF").unwrap();
        Err(StageError::ToolFailure {
            tool: "office converter".into(),
            detail: "core dumped".into(),
        })
    }
}

fn entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

struct FixedVector {
    name: &'static str,
    result: Result<Vec<u8>, StageError>,
}

#[async_trait]
impl VectorConverter for FixedVector {
    fn name(&self) -> &str {
        self.name
    }

    async fn rasterize(&self, input: &Path, _: &Path, _: Duration) -> Result<Vec<u8>, StageError> {
        assert!(input.exists(), "asset staged before conversion");
        self.result.clone()
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl PipelineObserver for Recorder {
    fn on_stage_start(&self, _document: &str, stage: Stage) {
        self.events.lock().unwrap().push(format!("start {stage}"));
    }

    fn on_stage_skipped(&self, _document: &str, stage: Stage, _reason: &str) {
        self.events.lock().unwrap().push(format!("skip {stage}"));
    }

    fn on_document_complete(&self, document: &str, images: usize, _warnings: usize) {
        self.events
            .lock()
            .unwrap()
            .push(format!("done {document} {images}"));
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

#[test]
fn job_classifies_and_counts_slides() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_deck(
        dir.path(),
        "plan.pptx",
        &[
            ("ppt/slides/slide1.xml", slide("one")),
            ("ppt/slides/slide2.xml", slide("two")),
            ("ppt/slides/slide3.xml", slide("three")),
        ],
    );
    let job = DocumentJob::new(&path, &PipelineConfig::default()).unwrap();
    assert_eq!(job.kind, DocumentKind::SlideDeck);
    assert_eq!(job.page_count, PageCount::Known(3));
    assert_eq!(job.display_name, "plan.pptx");
}

#[test]
fn missing_document_is_an_error() {
    let err = DocumentJob::new("/no/such/deck.pptx", &PipelineConfig::default()).unwrap_err();
    assert!(err.to_string().contains("deck.pptx"));
}

// ── Degradation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_converter_still_returns_embedded_images_and_text() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_deck(
        dir.path(),
        "deck.pptx",
        &[
            ("ppt/slides/slide1.xml", slide("Quarterly results")),
            ("ppt/media/image1.png", png_bytes(16, 16)),
        ],
    );
    let config = base_config()
        .office_converter(dir.path().join("no-such-soffice"))
        .build()
        .unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    let mut dedup = DedupIndex::new();

    let result = Pipeline::new(config)
        .process(&job, &mut dedup)
        .await
        .unwrap();

    assert_eq!(result.images.len(), 1);
    assert_eq!(result.images[0].source_stage(), Stage::EmbeddedExtract);
    assert_eq!(result.text_sections.len(), 1);
    assert!(result.text_sections[0].text.contains("Quarterly results"));
    assert!(
        result.warnings.iter().any(|w| w.contains("converter not found")),
        "{:?}",
        result.warnings
    );
}

#[cfg(unix)]
#[tokio::test]
async fn hung_converter_is_killed_at_its_deadline() {
    init_tracing();
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("fake-soffice");
    std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let path = write_deck(
        dir.path(),
        "deck.pptx",
        &[("ppt/media/image1.png", png_bytes(16, 16))],
    );
    let scratch = tempfile::tempdir().unwrap();
    let config = base_config()
        .office_converter(&script)
        .scratch_root(scratch.path())
        .base_timeout_secs(1)
        .per_page_timeout_secs(0)
        .max_timeout_secs(1)
        .build()
        .unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    let mut dedup = DedupIndex::new();

    let started = Instant::now();
    let result = Pipeline::new(config)
        .process(&job, &mut dedup)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.images.len(), 1);
    assert!(
        result.warnings.iter().any(|w| w.contains("timed out")),
        "{:?}",
        result.warnings
    );
    assert!(result.stats.stages_skipped.contains(&Stage::Rasterize));
    assert!(entries(scratch.path()).is_empty(), "scratch left behind");
}

#[tokio::test]
async fn failed_conversion_removes_scratch_directory() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let path = write_deck(
        dir.path(),
        "deck.pptx",
        &[("ppt/media/image1.png", png_bytes(16, 16))],
    );
    let config = base_config()
        .scratch_root(scratch.path())
        .build()
        .unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    let mut dedup = DedupIndex::new();

    let result = Pipeline::new(config)
        .with_office_converter(Arc::new(CrashingConverter))
        .process(&job, &mut dedup)
        .await
        .unwrap();

    assert_eq!(result.images.len(), 1);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("core dumped")));
    let left: Vec<String> = entries(scratch.path())
        .into_iter()
        .filter(|n| n.starts_with("docvision_"))
        .collect();
    assert!(left.is_empty(), "{left:?}");
}

#[tokio::test]
async fn small_budget_skips_conversion_but_keeps_embedded_images() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_deck(
        dir.path(),
        "deck.pptx",
        &[("ppt/media/image1.png", png_bytes(16, 16))],
    );
    let config = base_config()
        .total_processing_budget_secs(3)
        .build()
        .unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    let mut dedup = DedupIndex::new();

    let result = Pipeline::new(config)
        .with_office_converter(Arc::new(StubConverter))
        .process(&job, &mut dedup)
        .await
        .unwrap();

    assert_eq!(result.images.len(), 1);
    assert!(result.stats.stages_run == vec![Stage::EmbeddedExtract]);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.starts_with("fixed-layout conversion skipped")));
}

// ── Limits ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn count_limit_keeps_first_pages_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pdf(dir.path(), 10);
    let config = base_config().max_image_count(3).build().unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    assert_eq!(job.kind, DocumentKind::FixedLayout);
    let mut dedup = DedupIndex::new();

    let result = Pipeline::new(config)
        .with_renderer(Arc::new(FakeRenderer {
            pages: vec![(8, 8); 10],
        }))
        .process(&job, &mut dedup)
        .await
        .unwrap();

    let ordinals: Vec<usize> = result.images.iter().map(|i| i.ordinal()).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("image count limit")));
    assert!(!result.stats.stages_run.contains(&Stage::ConvertToFixedLayout));
}

#[tokio::test]
async fn oversized_page_is_dropped_and_later_pages_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pdf(dir.path(), 3);
    let config = base_config()
        .max_single_image_bytes(50_000)
        .build()
        .unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    let mut dedup = DedupIndex::new();

    let result = Pipeline::new(config)
        .with_renderer(Arc::new(FakeRenderer {
            pages: vec![(8, 8), (200, 200), (8, 8)],
        }))
        .process(&job, &mut dedup)
        .await
        .unwrap();

    let ordinals: Vec<usize> = result.images.iter().map(|i| i.ordinal()).collect();
    assert_eq!(ordinals, vec![0, 2]);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.starts_with("page 2 dropped") && w.contains("per-image limit")));
    assert!(result.images.iter().all(|i| i.size_bytes() <= 50_000));
}

// ── Vector fallback ──────────────────────────────────────────────────────────

#[tokio::test]
async fn vector_drawing_converted_by_second_tool() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_deck(
        dir.path(),
        "deck.pptx",
        &[
            ("ppt/slides/slide1.xml", slide("Architecture")),
            ("ppt/media/image1.emf", vec![1u8; 64]),
        ],
    );
    let config = base_config().build().unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    let mut dedup = DedupIndex::new();
    let converted = png_bytes(4, 4);

    let result = Pipeline::new(config)
        .with_office_converter(Arc::new(StubConverter))
        .with_renderer(Arc::new(FakeRenderer {
            pages: vec![(8, 8)],
        }))
        .with_vector_chain(vec![
            Arc::new(FixedVector {
                name: "first",
                result: Err(StageError::ToolUnavailable {
                    tool: "image converter".into(),
                }),
            }),
            Arc::new(FixedVector {
                name: "second",
                result: Ok(converted.clone()),
            }),
        ])
        .process(&job, &mut dedup)
        .await
        .unwrap();

    let stages: Vec<Stage> = result.images.iter().map(|i| i.source_stage()).collect();
    assert_eq!(stages, vec![Stage::Rasterize, Stage::VectorFallback]);
    assert_eq!(result.images[1].bytes(), converted.as_slice());
    assert_eq!(result.stats.vector_images, 1);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
}

#[tokio::test]
async fn disabled_vector_fallback_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_deck(
        dir.path(),
        "deck.pptx",
        &[
            ("ppt/slides/slide1.xml", slide("Architecture")),
            ("ppt/media/image1.wmf", vec![1u8; 64]),
        ],
    );
    let recorder = Arc::new(Recorder::default());
    let config = base_config()
        .enable_vector_fallback(false)
        .observer(recorder.clone() as Arc<dyn PipelineObserver>)
        .build()
        .unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    let mut dedup = DedupIndex::new();

    let result = Pipeline::new(config)
        .with_office_converter(Arc::new(StubConverter))
        .with_renderer(Arc::new(FakeRenderer {
            pages: vec![(8, 8)],
        }))
        .process(&job, &mut dedup)
        .await
        .unwrap();

    assert_eq!(result.images.len(), 1);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.starts_with("1 vector graphic(s) not converted")));
    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "start embedded extraction",
            "start fixed-layout conversion",
            "start rasterisation",
            "skip vector conversion",
            "done deck.pptx 1",
        ]
    );
}

// ── Sessions ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_skips_repeated_content() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_deck(
        dir.path(),
        "a.pptx",
        &[("ppt/media/image1.png", png_bytes(16, 16))],
    );
    let copy = dir.path().join("b.pptx");
    std::fs::copy(&first, &copy).unwrap();
    let config = base_config()
        .office_converter(dir.path().join("no-such-soffice"))
        .build()
        .unwrap();
    let jobs = vec![
        DocumentJob::new(&first, &config).unwrap(),
        DocumentJob::new(&copy, &config).unwrap(),
    ];
    let mut dedup = DedupIndex::new();

    let results = Pipeline::new(config).process_all(&jobs, &mut dedup).await;

    assert_eq!(results.len(), 2);
    let a = results[0].as_ref().unwrap();
    let b = results[1].as_ref().unwrap();
    assert!(!a.duplicate);
    assert!(b.duplicate);
    assert!(b.images.is_empty());
    assert!(b.warnings[0].contains("b.pptx"));
    assert_eq!(dedup.len(), 1);
}

#[test]
fn sync_wrapper_processes_a_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_deck(
        dir.path(),
        "deck.pptx",
        &[("ppt/media/image1.png", png_bytes(16, 16))],
    );
    let config = base_config()
        .office_converter(dir.path().join("no-such-soffice"))
        .build()
        .unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    let mut dedup = DedupIndex::new();

    let result = edgequake_docvision::process_document_sync(&job, &config, &mut dedup).unwrap();
    assert_eq!(result.images.len(), 1);
    assert!(dedup.contains(job.content_hash));
}

// ── pdfium ───────────────────────────────────────────────────────────────────

/// Two blank pages with a correct cross-reference table.
fn minimal_pdf(path: &Path) {
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>",
        "<< /Type /Pages /Kids [3 0 R 4 0 R] /Count 2 >>",
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 200 100] >>",
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 200 100] >>",
    ];
    let mut pdf = String::from("%PDF-1.4\n");
    let mut offsets = Vec::new();
    for (i, obj) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.push_str(&format!("{} 0 obj\n{}\nendobj\n", i + 1, obj));
    }
    let xref = pdf.len();
    pdf.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
    for off in offsets {
        pdf.push_str(&format!("{:010} 00000 n \n", off));
    }
    pdf.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref
    ));
    std::fs::write(path, pdf).unwrap();
}

#[tokio::test]
async fn pdfium_renders_every_page() {
    init_tracing();
    let lib = skip_unless_pdfium!();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blank.pdf");
    minimal_pdf(&path);

    let config = base_config().pdfium_library(lib).dpi(72).build().unwrap();
    let job = DocumentJob::new(&path, &config).unwrap();
    assert_eq!(job.page_count, PageCount::Known(2));
    let mut dedup = DedupIndex::new();

    let result = Pipeline::new(config)
        .process(&job, &mut dedup)
        .await
        .unwrap();

    assert_eq!(result.stats.rendered_pages, 2, "{:?}", result.warnings);
    for page in &result.images {
        assert_eq!(page.mime_type(), "image/png");
        assert!(page.bytes().starts_with(b"\x89PNG"));
    }
}
