//! Text extraction for solicitation attachments.
//!
//! The format is chosen from the file extension. Every file is decoded on the
//! blocking pool under a time budget, so a pathological document cannot
//! stall the other files of the same archive.
//!
//! | Extension | Decoder | Sections |
//! |-----------|---------|----------|
//! | `.pdf` | `pdf-extract` | one per page |
//! | `.docx` | `word/document.xml` runs | one |
//! | `.pptx` | `ppt/slides/slideN.xml` runs | one per slide |
//! | `.xlsx` | shared strings per sheet | one per sheet |
//! | `.txt` `.md` `.csv` | UTF-8 (lossy) | one |
//! | `.htm` `.html` | tags stripped | one |
//! | `.zip` | supported members, one level deep | per member |
//!
//! Anything else is `unsupported-format`. A decoder error or panic is
//! `corrupt-or-unreadable`.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use quick_xml::events::Event;
use thiserror::Error;
use tracing::warn;

use crate::error::ErrorKind;
use crate::models::ExtractionStatus;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Zip-bomb guard for XML parts and nested archive members.
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Plain text of a document, one entry per page, slide, sheet or member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedText {
    pub sections: Vec<String>,
}

impl ExtractedText {
    pub fn single(text: String) -> Self {
        Self {
            sections: vec![text],
        }
    }

    /// Sections joined with blank lines, order preserved.
    pub fn joined(&self) -> String {
        self.sections.join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractFailure {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt or unreadable: {0}")]
    CorruptOrUnreadable(String),

    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
}

impl ExtractFailure {
    pub fn status(&self) -> ExtractionStatus {
        match self {
            ExtractFailure::UnsupportedFormat(_) => ExtractionStatus::UnsupportedFormat,
            ExtractFailure::CorruptOrUnreadable(_) => ExtractionStatus::CorruptOrUnreadable,
            ExtractFailure::Timeout(_) => ExtractionStatus::Timeout,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractFailure::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            ExtractFailure::CorruptOrUnreadable(_) | ExtractFailure::Timeout(_) => {
                ErrorKind::MalformedInput
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    PlainText,
    Html,
    Zip,
}

impl Format {
    pub fn from_filename(name: &str) -> Option<Format> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Format::Pdf),
            "docx" => Some(Format::Docx),
            "pptx" => Some(Format::Pptx),
            "xlsx" => Some(Format::Xlsx),
            "txt" | "md" | "csv" => Some(Format::PlainText),
            "htm" | "html" => Some(Format::Html),
            "zip" => Some(Format::Zip),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Format::Pdf => MIME_PDF,
            Format::Docx => MIME_DOCX,
            Format::Pptx => MIME_PPTX,
            Format::Xlsx => MIME_XLSX,
            Format::PlainText => "text/plain",
            Format::Html => "text/html",
            Format::Zip => "application/zip",
        }
    }
}

/// Extract text from `bytes` named `name`. Synchronous; see [`Extractor`]
/// for the bounded async entry point.
pub fn extract_bytes(bytes: &[u8], name: &str) -> Result<ExtractedText, ExtractFailure> {
    let format = Format::from_filename(name)
        .ok_or_else(|| ExtractFailure::UnsupportedFormat(name.to_string()))?;
    decode(bytes, format, true)
}

fn decode(bytes: &[u8], format: Format, allow_nested: bool) -> Result<ExtractedText, ExtractFailure> {
    match format {
        Format::Pdf => extract_pdf(bytes),
        Format::Docx => extract_docx(bytes),
        Format::Pptx => extract_pptx(bytes),
        Format::Xlsx => extract_xlsx(bytes),
        Format::PlainText => Ok(ExtractedText::single(
            String::from_utf8_lossy(bytes).into_owned(),
        )),
        Format::Html => Ok(ExtractedText::single(strip_html(&String::from_utf8_lossy(
            bytes,
        )))),
        Format::Zip if allow_nested => extract_nested_zip(bytes),
        Format::Zip => Err(ExtractFailure::UnsupportedFormat(
            "archive nested more than one level".to_string(),
        )),
    }
}

fn corrupt(e: impl std::fmt::Display) -> ExtractFailure {
    ExtractFailure::CorruptOrUnreadable(e.to_string())
}

/// A synchronous format decoder: bytes and file name in, text out.
pub type Decoder = dyn Fn(&[u8], &str) -> Result<ExtractedText, ExtractFailure> + Send + Sync;

/// Runs extraction on the blocking pool with a per-file time budget.
#[derive(Clone)]
pub struct Extractor {
    timeout: Duration,
    decoder: Arc<Decoder>,
}

impl Extractor {
    pub fn new(timeout: Duration) -> Self {
        Self::with_decoder(timeout, Arc::new(extract_bytes))
    }

    /// Use a custom decoder in place of [`extract_bytes`].
    pub fn with_decoder(timeout: Duration, decoder: Arc<Decoder>) -> Self {
        Self { timeout, decoder }
    }

    /// Extract `bytes`. A timeout abandons the blocking task; its result is
    /// discarded when it eventually finishes.
    pub async fn extract(&self, bytes: Vec<u8>, name: String) -> Result<ExtractedText, ExtractFailure> {
        let decoder = self.decoder.clone();
        let handle = tokio::task::spawn_blocking(move || decoder(&bytes, &name));

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => Err(corrupt("decoder panicked")),
            Ok(Err(join)) => Err(corrupt(join)),
            Err(_) => Err(ExtractFailure::Timeout(self.timeout)),
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText, ExtractFailure> {
    let text = pdf_extract::extract_text_from_mem(bytes).map_err(corrupt)?;
    // pages are separated by form feeds
    let mut sections: Vec<String> = text.split('\u{c}').map(str::to_string).collect();
    while sections.len() > 1 && sections.last().is_some_and(|s| s.trim().is_empty()) {
        sections.pop();
    }
    Ok(ExtractedText { sections })
}

type ZipReader<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<ZipReader<'_>, ExtractFailure> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(corrupt)
}

fn read_entry_bounded(archive: &mut ZipReader<'_>, name: &str) -> Result<Vec<u8>, ExtractFailure> {
    let entry = archive.by_name(name).map_err(corrupt)?;
    let mut out = Vec::new();
    entry
        .take(MAX_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(corrupt)?;
    if out.len() as u64 >= MAX_ENTRY_BYTES {
        return Err(corrupt(format!("{} exceeds size limit", name)));
    }
    Ok(out)
}

/// Part names matching `prefix<N>.xml`, in numeric order.
fn numbered_parts(archive: &ZipReader<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedText, ExtractFailure> {
    let mut archive = open_zip(bytes)?;
    let xml = read_entry_bounded(&mut archive, "word/document.xml")?;
    Ok(ExtractedText::single(collect_text_runs(&xml, b"p", "\n")?))
}

fn extract_pptx(bytes: &[u8]) -> Result<ExtractedText, ExtractFailure> {
    let mut archive = open_zip(bytes)?;
    let mut sections = Vec::new();
    for name in numbered_parts(&archive, "ppt/slides/slide") {
        let xml = read_entry_bounded(&mut archive, &name)?;
        sections.push(collect_text_runs(&xml, b"p", " ")?);
    }
    Ok(ExtractedText { sections })
}

/// Concatenate the text of every `<*:t>` element, inserting `sep` at the
/// end of each `para` element.
fn collect_text_runs(xml: &[u8], para: &[u8], sep: &str) -> Result<String, ExtractFailure> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == para && !out.is_empty() && !out.ends_with(sep) {
                    out.push_str(sep);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_xlsx(bytes: &[u8]) -> Result<ExtractedText, ExtractFailure> {
    let mut archive = open_zip(bytes)?;
    let shared = read_shared_strings(&mut archive)?;
    let mut sections = Vec::new();
    for name in numbered_parts(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry_bounded(&mut archive, &name)?;
        sections.push(sheet_cells(&xml, &shared)?);
    }
    Ok(ExtractedText { sections })
}

fn read_shared_strings(archive: &mut ZipReader<'_>) -> Result<Vec<String>, ExtractFailure> {
    // a workbook with only numbers has no shared strings part
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<String, ExtractFailure> {
    let mut cells: Vec<&str> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut shared_cell = false;
    while cells.len() < XLSX_MAX_CELLS_PER_SHEET {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" => in_v = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_v && shared_cell => {
                let v = te.unescape().unwrap_or_default();
                if let Some(s) = v.trim().parse::<usize>().ok().and_then(|i| shared.get(i)) {
                    cells.push(s);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"c" => shared_cell = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

/// Text of every supported member of a zip attachment, one section each.
///
/// A broken member does not spoil its siblings, but an archive that yields
/// nothing readable is itself a failure: corrupt if any member was corrupt,
/// otherwise unsupported.
fn extract_nested_zip(bytes: &[u8]) -> Result<ExtractedText, ExtractFailure> {
    let mut archive = open_zip(bytes)?;
    let mut members: Vec<(String, Format)> = archive
        .file_names()
        .filter(|n| !n.ends_with('/') && !n.starts_with("__MACOSX"))
        .filter_map(|n| Format::from_filename(n).map(|f| (n.to_string(), f)))
        .collect();
    members.sort_by(|a, b| a.0.cmp(&b.0));
    if members.is_empty() {
        return Err(ExtractFailure::UnsupportedFormat(
            "archive has no supported members".to_string(),
        ));
    }

    let mut sections = Vec::new();
    let mut failed: Vec<(String, ExtractFailure)> = Vec::new();
    for (name, format) in members {
        let decoded = read_entry_bounded(&mut archive, &name).and_then(|data| decode(&data, format, false));
        match decoded {
            Ok(text) => sections.extend(text.sections),
            Err(e) => {
                warn!(member = %name, status = %e.status(), "skipping archive member: {}", e);
                failed.push((name, e));
            }
        }
    }

    if sections.is_empty() {
        let detail = failed
            .iter()
            .map(|(name, e)| format!("{} ({})", name, e))
            .collect::<Vec<_>>()
            .join(", ");
        let any_corrupt = failed
            .iter()
            .any(|(_, e)| matches!(e, ExtractFailure::CorruptOrUnreadable(_)));
        return Err(if any_corrupt {
            ExtractFailure::CorruptOrUnreadable(format!("no readable members: {}", detail))
        } else {
            ExtractFailure::UnsupportedFormat(format!("no readable members: {}", detail))
        });
    }
    Ok(ExtractedText { sections })
}

/// Drop markup, `<script>`/`<style>` bodies, and decode the common entities.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];
        let close = match after.find('>') {
            Some(c) => c,
            None => {
                rest = "";
                break;
            }
        };
        let tag = after[1..close].trim_start().to_ascii_lowercase();
        rest = &after[close + 1..];
        for skipped in ["script", "style"] {
            if tag.starts_with(skipped) {
                let end = format!("</{}", skipped);
                rest = match rest.to_ascii_lowercase().find(&end) {
                    Some(i) => &rest[i..],
                    None => "",
                };
            }
        }
        out.push(' ');
    }
    out.push_str(rest);

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
