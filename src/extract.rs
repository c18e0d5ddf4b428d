//! Text extraction from files on disk.
//!
//! | Kind | Extensions | Method |
//! |------|------------|--------|
//! | Text | docs, source, config, data | UTF-8, lossy |
//! | PDF | `pdf` | `pdf-extract` |
//! | Word | `docx` | `w:t` runs from `word/document.xml` |
//! | PowerPoint | `pptx` | `a:t` runs from each slide, in slide order |
//! | Excel | `xlsx` | shared strings and inline values, sheet by sheet |
//! | Image | `png`, `jpg`, `tiff`, ... | [`OcrEngine`], only when one is configured |
//!
//! Failures are per file and never panic. Timeouts are applied by the
//! caller.

use async_trait::async_trait;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use folio_core::error::ExtractionError;
use folio_core::extract::ContentExtractor;

/// Upper bound on decompressed bytes read from one ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

const TEXT_EXTENSIONS: &[&str] = &[
    // prose
    "txt", "md", "markdown", "rst", "adoc", "tex", "org",
    // data
    "csv", "tsv", "log", "sql", "xml", "html", "htm",
    // config
    "toml", "yaml", "yml", "json", "ini", "cfg", "conf", "env",
    // source
    "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "c", "cpp", "h", "hpp", "cs", "rb",
    "sh", "kt", "swift", "php", "lua", "scala", "css",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Image,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Option<FileKind> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(FileKind::Pdf),
            "docx" => Some(FileKind::Docx),
            "pptx" => Some(FileKind::Pptx),
            "xlsx" => Some(FileKind::Xlsx),
            e if TEXT_EXTENSIONS.contains(&e) => Some(FileKind::Text),
            e if IMAGE_EXTENSIONS.contains(&e) => Some(FileKind::Image),
            _ => None,
        }
    }
}

/// Turns an image into text.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, path: &Path) -> Result<String, ExtractionError>;
}

/// Runs an external program, e.g. `tesseract {path} stdout`, and takes its
/// stdout as the recognized text.
pub struct CommandOcr {
    argv: Vec<String>,
}

impl CommandOcr {
    /// `None` when `argv` is empty.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(Self { argv })
        }
    }
}

#[async_trait]
impl OcrEngine for CommandOcr {
    async fn recognize(&self, path: &Path) -> Result<String, ExtractionError> {
        let path_str = path.to_string_lossy();
        let args: Vec<String> = self.argv[1..]
            .iter()
            .map(|a| a.replace("{path}", &path_str))
            .collect();

        let output = tokio::process::Command::new(&self.argv[0])
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExtractionError::Ocr(format!("{}: {}", self.argv[0], e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractionError::Ocr(format!(
                "{} exited with {}: {}",
                self.argv[0],
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Built-in [`ContentExtractor`] dispatching on file extension.
#[derive(Clone, Default)]
pub struct FileExtractor {
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl FileExtractor {
    pub fn new(ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self { ocr }
    }

    pub fn from_config(config: &crate::config::ExtractionConfig) -> Self {
        let ocr = CommandOcr::new(config.ocr_command.clone())
            .map(|engine| Arc::new(engine) as Arc<dyn OcrEngine>);
        Self::new(ocr)
    }
}

#[async_trait]
impl ContentExtractor for FileExtractor {
    fn supports(&self, path: &Path) -> bool {
        match FileKind::from_path(path) {
            Some(FileKind::Image) => self.ocr.is_some(),
            Some(_) => true,
            None => false,
        }
    }

    async fn extract(&self, path: &Path) -> Result<String, ExtractionError> {
        let kind = FileKind::from_path(path)
            .ok_or_else(|| ExtractionError::Unsupported(path.display().to_string()))?;

        if kind == FileKind::Image {
            let ocr = self
                .ocr
                .as_ref()
                .ok_or_else(|| ExtractionError::Unsupported(path.display().to_string()))?;
            return ocr.recognize(path).await;
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ExtractionError::Unreadable(format!("{}: {}", path.display(), e)))?;

        if kind == FileKind::Text {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }

        let owned: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || extract_binary(&bytes, kind))
            .await
            .map_err(|e| {
                ExtractionError::Unreadable(format!("{}: worker failed: {}", owned.display(), e))
            })?
    }
}

/// Extract text from an in-memory PDF or OOXML file.
pub fn extract_binary(bytes: &[u8], kind: FileKind) -> Result<String, ExtractionError> {
    match kind {
        FileKind::Pdf => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractionError::Pdf(e.to_string())),
        FileKind::Docx => {
            let mut archive = open_zip(bytes)?;
            let xml = read_entry(&mut archive, "word/document.xml")?;
            collect_runs(&xml, b"t")
        }
        FileKind::Pptx => {
            let mut archive = open_zip(bytes)?;
            let slides = numbered_entries(&archive, "ppt/slides/slide");
            let mut parts = Vec::with_capacity(slides.len());
            for name in slides {
                let xml = read_entry(&mut archive, &name)?;
                parts.push(collect_runs(&xml, b"t")?);
            }
            Ok(join_nonempty(parts))
        }
        FileKind::Xlsx => {
            let mut archive = open_zip(bytes)?;
            let shared = match read_entry(&mut archive, "xl/sharedStrings.xml") {
                Ok(xml) => shared_strings(&xml)?,
                Err(_) => Vec::new(),
            };
            let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
            let mut parts = Vec::new();
            for name in sheets.into_iter().take(XLSX_MAX_SHEETS) {
                let xml = read_entry(&mut archive, &name)?;
                parts.push(sheet_cells(&xml, &shared)?);
            }
            Ok(join_nonempty(parts))
        }
        FileKind::Text | FileKind::Image => Err(ExtractionError::Unsupported(format!(
            "{:?} is not a binary document kind",
            kind
        ))),
    }
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn ooxml(e: impl std::fmt::Display) -> ExtractionError {
    ExtractionError::Ooxml(e.to_string())
}

fn open_zip(bytes: &[u8]) -> Result<Archive<'_>, ExtractionError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml)
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractionError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ooxml(format!("{name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml(format!(
            "{name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        )));
    }
    Ok(out)
}

/// Entries named `<prefix><n>.xml`, ordered by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let n = name.strip_prefix(prefix)?.strip_suffix(".xml")?;
            Some((n.parse().unwrap_or(u32::MAX), name.to_string()))
        })
        .collect();
    names.sort();
    names.into_iter().map(|(_, name)| name).collect()
}

fn join_nonempty(parts: Vec<String>) -> String {
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Concatenate the text of every `<*:local>` element, one paragraph per
/// `<*:p>`.
fn collect_runs(xml: &[u8], local: &[u8]) -> Result<String, ExtractionError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_run = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml)? {
            Event::Start(e) if e.local_name().as_ref() == local => in_run = true,
            Event::End(e) if e.local_name().as_ref() == local => in_run = false,
            Event::End(e) if e.local_name().as_ref() == b"p" => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::Text(t) if in_run => {
                out.push_str(&t.unescape().map_err(ooxml)?);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractionError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Event::Text(t) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&t.unescape().map_err(ooxml)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one worksheet, space separated. Shared-string cells are
/// resolved; numeric and inline values are taken as written.
fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<String, ExtractionError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cells: Vec<String> = Vec::new();
    let mut shared_cell = false;
    let mut in_value = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf).map_err(ooxml)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_cell = false,
                _ => {}
            },
            Event::Text(t) if in_value => {
                let raw = t.unescape().map_err(ooxml)?;
                let value = raw.trim();
                if value.is_empty() {
                    // whitespace between tags
                } else if shared_cell {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                        cells.push(s.clone());
                    }
                } else {
                    cells.push(value.to_string());
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}
