//! Text chunking.
//!
//! Two strategies are available:
//!
//! - [`ChunkStrategy::Fixed`] splits extracted text into byte windows of
//!   at most `max_bytes`, preferring to end a window after a newline, then
//!   after a sentence (`". "`), then after a space. Consecutive windows
//!   overlap by up to `overlap_bytes` so that context spanning a boundary
//!   is embedded twice.
//! - [`ChunkStrategy::Semantic`] first cuts the text at structural
//!   boundaries for its file type (function and type definitions in
//!   source code, headings in Markdown, sections in config files), then
//!   packs neighbouring sections into windows of at most `max_bytes`. An
//!   oversized section falls back to fixed windows.
//!
//! Both are deterministic: the same text and configuration always produce
//! the same spans with the same byte offsets. Windows never split a UTF-8
//! code point, and no window repeats only text its predecessor already
//! covered.
//!
//! # Example
//!
//! ```rust
//! use folio_core::chunk::chunk_with_overlap;
//!
//! let spans = chunk_with_overlap("Hello world.", 800, 150);
//! assert_eq!(spans.len(), 1);
//! assert_eq!((spans[0].start, spans[0].end), (0, 12));
//! ```

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

use crate::models::Chunk;

/// Window size and overlap, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_bytes: usize,
    pub overlap_bytes: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_bytes: 800,
            overlap_bytes: 150,
        }
    }
}

/// Chunk sizes tuned per file family.
///
/// Source code gets larger windows so a function body tends to stay
/// together; config files get small ones.
pub fn config_for_extension(ext: &str) -> ChunkConfig {
    match ext.to_ascii_lowercase().as_str() {
        "rs" | "py" | "js" | "ts" | "tsx" | "jsx" | "go" | "java" | "c" | "cpp" | "h" | "hpp"
        | "cs" | "rb" => ChunkConfig {
            max_bytes: 1200,
            overlap_bytes: 200,
        },
        "toml" | "yaml" | "yml" | "json" | "ini" | "cfg" | "conf" | "env" => ChunkConfig {
            max_bytes: 600,
            overlap_bytes: 100,
        },
        // docs (md, txt, rst, ...), tabular data, logs, and everything else
        _ => ChunkConfig::default(),
    }
}

/// [`config_for_extension`] keyed by the path's extension.
pub fn config_for_path(path: &Path) -> ChunkConfig {
    path.extension()
        .and_then(|e| e.to_str())
        .map(config_for_extension)
        .unwrap_or_default()
}

/// How text is cut into chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    #[default]
    Fixed,
    Semantic,
}

/// A window of text produced by [`chunk_with_overlap`] or [`semantic_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan<'a> {
    /// Zero-based, contiguous.
    pub index: i64,
    /// Byte offset of the first byte.
    pub start: usize,
    /// Byte offset one past the last byte.
    pub end: usize,
    pub text: &'a str,
}

/// Split `text` into overlapping windows.
///
/// Whitespace-only windows are dropped; an empty or whitespace-only text
/// yields no spans. Every window makes forward progress, even when
/// `max_bytes` is smaller than a single character or `overlap_bytes`
/// exceeds `max_bytes`.
pub fn chunk_with_overlap(
    text: &str,
    max_bytes: usize,
    overlap_bytes: usize,
) -> Vec<TextSpan<'_>> {
    let mut spans = Spans::new(text);
    fixed_windows(&mut spans, 0, text.len(), max_bytes, overlap_bytes);
    spans.finish()
}

/// Chunk `text` from a file with extension `ext` using `strategy`.
pub fn chunk_text<'a>(
    text: &'a str,
    ext: &str,
    cfg: ChunkConfig,
    strategy: ChunkStrategy,
) -> Vec<TextSpan<'a>> {
    match strategy {
        ChunkStrategy::Fixed => chunk_with_overlap(text, cfg.max_bytes, cfg.overlap_bytes),
        ChunkStrategy::Semantic => semantic_chunk(text, ext, cfg),
    }
}

/// Line-start pattern of a structural boundary for a file type.
fn boundary_pattern(ext: &str) -> Option<&'static str> {
    let pattern = match ext.to_ascii_lowercase().as_str() {
        "rs" => {
            r"\n(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:fn |struct |enum |impl |trait |mod )"
        }
        "py" => r"\n(?:class |def |async def )",
        "js" | "jsx" => {
            r"\n(?:function |class |export (?:default )?(?:function |class |const |let ))"
        }
        "ts" | "tsx" => {
            r"\n(?:(?:export )?(?:function |class |interface |type |const |enum |async function ))"
        }
        "go" => r"\n(?:func |type )",
        "java" | "cs" => concat!(
            r"\n\s*(?:public |private |protected )?(?:static )?",
            r"(?:class |interface |void |int |string )"
        ),
        "c" | "cpp" | "h" | "hpp" => r"\n(?:[a-zA-Z_][a-zA-Z0-9_*\s]+\([^)]*\)\s*\{)",
        "rb" => r"\n(?:class |module |def )",
        "md" | "markdown" => r"\n#{1,6} ",
        "rst" | "adoc" | "txt" | "tex" | "bib" => r"\n\n",
        "toml" | "ini" | "cfg" => r"\n\[",
        "yaml" | "yml" => r"\n[a-zA-Z_][a-zA-Z0-9_]*:",
        _ => return None,
    };
    Some(pattern)
}

/// Split `text` at structural boundaries for `ext`, packing sections into
/// windows of at most `cfg.max_bytes`.
///
/// When a window is full, the next one starts with the last line of the
/// previous window if that line fits in `cfg.overlap_bytes` and the next
/// section still fits beside it. A single section larger than `max_bytes`
/// is cut by [`chunk_with_overlap`]. File types without a known boundary
/// pattern use fixed windows throughout.
pub fn semantic_chunk<'a>(text: &'a str, ext: &str, cfg: ChunkConfig) -> Vec<TextSpan<'a>> {
    let max_bytes = cfg.max_bytes.max(1);
    let Some(pattern) = boundary_pattern(ext).and_then(|p| Regex::new(p).ok()) else {
        return chunk_with_overlap(text, max_bytes, cfg.overlap_bytes);
    };

    // Boundaries sit at the start of the line after the matched newline.
    let mut bounds = vec![0];
    for m in pattern.find_iter(text) {
        let at = m.start() + 1;
        if bounds.last().is_some_and(|last| at > *last) {
            bounds.push(at);
        }
    }
    if bounds.last().is_some_and(|last| *last < text.len()) {
        bounds.push(text.len());
    }

    let mut spans = Spans::new(text);
    let mut start = 0;
    let mut end = 0;
    for section_end in bounds.into_iter().skip(1) {
        if section_end - start > max_bytes && end > start {
            if end > spans.covered {
                pack(&mut spans, start, end, max_bytes, cfg.overlap_bytes);
                start = carry_last_line(text, start, end, cfg.overlap_bytes);
                if section_end - start > max_bytes {
                    start = end;
                }
            } else {
                start = end;
            }
        }
        end = section_end;
    }
    if end > start {
        pack(&mut spans, start, end, max_bytes, cfg.overlap_bytes);
    }
    spans.finish()
}

/// Emit `text[start..end]` as one span, or as fixed windows if too long.
fn pack(spans: &mut Spans<'_>, start: usize, end: usize, max_bytes: usize, overlap: usize) {
    if end - start > max_bytes {
        fixed_windows(spans, start, end, max_bytes, overlap);
    } else {
        spans.push(start, end);
    }
}

/// Start of the last non-empty line of `text[start..end]` when that line
/// fits in `overlap` bytes, else `end`.
fn carry_last_line(text: &str, start: usize, end: usize, overlap: usize) -> usize {
    let body = text[start..end].trim_end_matches('\n');
    let line_start = body.rfind('\n').map(|i| start + i + 1).unwrap_or(start);
    let line_end = start + body.len();
    if line_start > start && line_end > line_start && end - line_start <= overlap {
        line_start
    } else {
        end
    }
}

/// Fixed windows over `text[from..to]`.
fn fixed_windows(
    spans: &mut Spans<'_>,
    from: usize,
    to: usize,
    max_bytes: usize,
    overlap: usize,
) {
    let text = spans.text;
    let max_bytes = max_bytes.max(1);
    let mut start = from;

    while start < to {
        let mut end = (start + max_bytes).min(to);
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // window narrower than one code point
            end = start
                + text[start..]
                    .chars()
                    .next()
                    .map(char::len_utf8)
                    .unwrap_or(1);
        }

        if end >= to {
            spans.push(start, to);
            break;
        }

        let window = &text[start..end];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(". "))
            .or_else(|| window.rfind(' '))
            .map(|i| start + i + 1)
            .unwrap_or(end);

        spans.push(start, split_at);

        let rewind = overlap.min(split_at - start);
        let mut next = split_at - rewind;
        while next > start && !text.is_char_boundary(next) {
            next += 1;
        }
        if next <= start {
            next = split_at;
        }
        start = next;
    }
}

/// Collects spans, numbering them and dropping any that add no new text.
struct Spans<'a> {
    text: &'a str,
    spans: Vec<TextSpan<'a>>,
    /// End of the last emitted span.
    covered: usize,
}

impl<'a> Spans<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            spans: Vec::new(),
            covered: 0,
        }
    }

    fn push(&mut self, start: usize, end: usize) {
        let piece = &self.text[start..end];
        if piece.trim().is_empty() {
            return;
        }
        let fresh = self.covered.max(start).min(end);
        if self.text[fresh..end].trim().is_empty() {
            return;
        }
        self.spans.push(TextSpan {
            index: self.spans.len() as i64,
            start,
            end,
            text: piece,
        });
        self.covered = end;
    }

    fn finish(self) -> Vec<TextSpan<'a>> {
        self.spans
    }
}

/// Build a stored [`Chunk`] from a span and its embedding.
pub fn make_chunk(path: &Path, span: &TextSpan<'_>, vector: Vec<f32>) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        path: path.to_path_buf(),
        chunk_index: span.index,
        start: span.start,
        end: span.end,
        text: span.text.to_string(),
        hash: sha256_hex(span.text.as_bytes()),
        vector,
    }
}

/// SHA-256 of `bytes`, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
