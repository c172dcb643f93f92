//! Per-slide text and speaker notes from `.pptx` decks.
//!
//! Slides are visited in presentation order (`ppt/presentation.xml`), not
//! file-name order. Paragraph text comes from DrawingML runs (`<a:t>`),
//! tables are flattened to `" | "`-joined rows, and field placeholders
//! (slide numbers, dates) are dropped.

use crate::error::StageError;
use crate::output::TextSection;
use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tracing::{debug, info};

/// Upper bound on extracted text per document, in characters.
pub const MAX_TEXT_CHARS: usize = 100_000;

const NOTES_HEADER: &str = "[Notes]";

static SLIDE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ppt/slides/slide(\d+)\.xml$").unwrap());

/// Text sections plus any per-slide problems.
#[derive(Debug, Default)]
pub struct SlideText {
    pub sections: Vec<TextSection>,
    pub warnings: Vec<String>,
    /// True when [`MAX_TEXT_CHARS`] cut the text short.
    pub truncated: bool,
}

/// Extract one [`TextSection`] per slide that has text or notes.
pub fn extract_slide_text(path: &Path) -> Result<SlideText, StageError> {
    let file = File::open(path).map_err(|e| StageError::CorruptInput {
        detail: e.to_string(),
    })?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| StageError::CorruptInput {
            detail: format!("not a readable archive: {e}"),
        })?;

    let slides = slide_order(&mut archive);
    let mut out = SlideText::default();
    let mut chars = 0usize;

    for (position, part) in slides.iter().enumerate() {
        let label = format!("Slide {}", position + 1);
        let body = match read_part(&mut archive, part).map(|xml| paragraphs(&xml)) {
            Some(Ok(lines)) => lines.join("\n"),
            Some(Err(e)) => {
                out.warnings.push(format!("{label}: unreadable slide XML: {e}"));
                continue;
            }
            None => continue,
        };

        let notes = notes_part(&mut archive, part)
            .and_then(|notes| read_part(&mut archive, &notes))
            .and_then(|xml| paragraphs(&xml).ok())
            .map(|lines| lines.join("\n"))
            .unwrap_or_default();

        let mut text = body;
        if !notes.is_empty() {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(NOTES_HEADER);
            text.push('\n');
            text.push_str(&notes);
        }
        if text.is_empty() {
            continue;
        }

        let len = text.chars().count();
        if chars + len > MAX_TEXT_CHARS {
            let room = MAX_TEXT_CHARS - chars;
            if room > 0 {
                out.sections.push(TextSection {
                    label,
                    text: text.chars().take(room).collect(),
                });
            }
            out.truncated = true;
            break;
        }
        chars += len;
        out.sections.push(TextSection { label, text });
    }

    info!(
        "Slide text: {} section(s) from {} slide(s), {} chars",
        out.sections.len(),
        slides.len(),
        chars
    );
    Ok(out)
}

/// Slide part names in presentation order; falls back to numeric order.
fn slide_order<R: Read + Seek>(archive: &mut zip::ZipArchive<R>) -> Vec<String> {
    let ordered = read_part(archive, "ppt/presentation.xml").and_then(|presentation| {
        let rels = read_part(archive, "ppt/_rels/presentation.xml.rels")?;
        let targets = relationships(&rels).ok()?;
        let ids = slide_ids(&presentation).ok()?;
        let parts: Vec<String> = ids
            .iter()
            .filter_map(|id| targets.get(id))
            .map(|(_, target)| resolve_target("ppt", target))
            .filter(|part| archive.index_for_name(part).is_some())
            .collect();
        (!parts.is_empty()).then_some(parts)
    });
    if let Some(parts) = ordered {
        return parts;
    }

    debug!("No usable presentation.xml; ordering slides by part number");
    let mut numbered: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let n = SLIDE_NUMBER_RE.captures(name)?.get(1)?.as_str().parse().ok()?;
            Some((n, name.to_string()))
        })
        .collect();
    numbered.sort();
    numbered.into_iter().map(|(_, name)| name).collect()
}

/// Notes part linked from a slide's relationships, if any.
fn notes_part<R: Read + Seek>(archive: &mut zip::ZipArchive<R>, slide: &str) -> Option<String> {
    let (dir, file) = slide.rsplit_once('/')?;
    let rels = read_part(archive, &format!("{dir}/_rels/{file}.rels"))?;
    relationships(&rels)
        .ok()?
        .into_values()
        .find(|(kind, _)| kind.ends_with("/notesSlide"))
        .map(|(_, target)| resolve_target(dir, &target))
}

fn read_part<R: Read + Seek>(archive: &mut zip::ZipArchive<R>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml).ok()?;
    Some(xml)
}

/// `Id → (Type, Target)` from a `.rels` part.
fn relationships(xml: &str) -> Result<HashMap<String, (String, String)>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut map = HashMap::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"Relationship" => {
                let (mut id, mut kind, mut target) = (None, String::new(), None);
                for attr in e.attributes().flatten() {
                    let value = attr.unescape_value()?.into_owned();
                    match attr.key.as_ref() {
                        b"Id" => id = Some(value),
                        b"Type" => kind = value,
                        b"Target" => target = Some(value),
                        _ => {}
                    }
                }
                if let (Some(id), Some(target)) = (id, target) {
                    map.insert(id, (kind, target));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(map)
}

/// `r:id` values of `<p:sldId>` in document order.
fn slide_ids(xml: &str) -> Result<Vec<String>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut ids = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"p:sldId" => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"r:id" {
                        ids.push(attr.unescape_value()?.into_owned());
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(ids)
}

/// Resolve a relationship target against the directory of its source part.
fn resolve_target(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = base_dir.split('/').filter(|p| !p.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            ".." => {
                parts.pop();
            }
            "." | "" => {}
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Non-empty paragraphs of a slide or notes part. Table rows become one line.
fn paragraphs(xml: &str) -> Result<Vec<String>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut lines = Vec::new();
    let mut para = String::new();
    let mut cell = String::new();
    let mut row: Vec<String> = Vec::new();
    let mut in_run_text = false;
    let mut field_depth = 0usize;
    let mut cell_depth = 0usize;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"a:t" => in_run_text = true,
                b"a:fld" => field_depth += 1,
                b"a:tc" => cell_depth += 1,
                _ => {}
            },
            Event::Empty(e) => {
                if e.name().as_ref() == b"a:br" {
                    para.push('\n');
                }
            }
            Event::Text(t) => {
                if in_run_text && field_depth == 0 {
                    para.push_str(&t.unescape()?);
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"a:t" => in_run_text = false,
                b"a:fld" => field_depth = field_depth.saturating_sub(1),
                b"a:p" => {
                    let p = para.trim();
                    if !p.is_empty() {
                        if cell_depth > 0 {
                            if !cell.is_empty() {
                                cell.push(' ');
                            }
                            cell.push_str(p);
                        } else {
                            lines.push(p.to_string());
                        }
                    }
                    para.clear();
                }
                b"a:tc" => {
                    cell_depth = cell_depth.saturating_sub(1);
                    row.push(std::mem::take(&mut cell));
                }
                b"a:tr" => {
                    if row.iter().any(|c| !c.is_empty()) {
                        lines.push(row.join(" | "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(lines)
}
