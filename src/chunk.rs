//! Heading-aware, line-packing text chunker.
//!
//! Splits a [`ParsedDocument`] into [`DocumentChunk`]s that respect a
//! character budget derived from a token count (`tokens * 4`, never below
//! 32 characters). When heading awareness is on, Markdown heading lines
//! start new sections and every chunk carries the nearest preceding
//! heading as its `heading_context`. Within a section, lines are packed
//! into a buffer; when the next line would overflow, the buffer is flushed
//! and a line-granular suffix of it seeds the next chunk as overlap.
//!
//! Each chunk receives a SHA-256 `hash` of its text (used for exact
//! deduplication) and a deterministic `id` derived from the source value,
//! its index, and its text.

use crate::config::ChunkingConfig;
use crate::hash::{hash_parts, hash_text};
use crate::models::{DocumentChunk, ParsedDocument};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Floor for the per-chunk character budget.
const MIN_CHUNK_CHARS: usize = 32;

/// Chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    pub tokens: usize,
    pub overlap: usize,
    pub heading_aware: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            tokens: 400,
            overlap: 80,
            heading_aware: true,
        }
    }
}

impl From<&ChunkingConfig> for ChunkOptions {
    fn from(config: &ChunkingConfig) -> Self {
        Self {
            tokens: config.max_tokens,
            overlap: config.overlap_tokens,
            heading_aware: config.heading_aware,
        }
    }
}

impl ChunkOptions {
    fn max_chars(&self) -> usize {
        MIN_CHUNK_CHARS.max(self.tokens.saturating_mul(CHARS_PER_TOKEN))
    }

    /// Overlap is capped at half the budget so every chunk makes progress.
    fn overlap_chars(&self) -> usize {
        self.overlap
            .saturating_mul(CHARS_PER_TOKEN)
            .min(self.max_chars() / 2)
    }
}

/// Chunk a parsed document. Empty documents produce no chunks.
pub fn chunk_document(doc: &ParsedDocument, options: &ChunkOptions) -> Vec<DocumentChunk> {
    chunk_text(&doc.source.value, &doc.content, options)
}

/// Chunk raw text attributed to `source_value`.
pub fn chunk_text(source_value: &str, content: &str, options: &ChunkOptions) -> Vec<DocumentChunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let normalized = content.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.trim_end().split('\n').collect();

    let sections = if options.heading_aware {
        split_sections(&lines)
    } else {
        vec![Section {
            heading: None,
            start: 0,
            end: lines.len(),
        }]
    };

    let max_chars = options.max_chars();
    let overlap_chars = options.overlap_chars();

    let mut pieces = Vec::new();
    for section in &sections {
        pack_section(
            &lines[section.start..section.end],
            section.start,
            section.heading.as_deref(),
            max_chars,
            overlap_chars,
            &mut pieces,
        );
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| make_chunk(source_value, index, total, piece))
        .collect()
}

/// A contiguous run of lines sharing one heading context.
#[derive(Debug)]
struct Section {
    heading: Option<String>,
    start: usize,
    end: usize,
}

/// Chunk text before ids are assigned.
#[derive(Debug)]
struct Piece {
    text: String,
    start_line: usize,
    end_line: usize,
    heading: Option<String>,
}

/// Returns the heading text if `line` is an ATX Markdown heading
/// (`#` through `######` followed by whitespace and text).
fn heading_text(line: &str) -> Option<&str> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let hashes = rest.len() - rest.trim_start_matches('#').len();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    let after = &rest[hashes..];
    if !after.starts_with([' ', '\t']) {
        return None;
    }
    let text = after.trim().trim_end_matches('#').trim();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

fn split_sections(lines: &[&str]) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = Section {
        heading: None,
        start: 0,
        end: 0,
    };
    let mut in_fence = false;

    for (i, line) in lines.iter().enumerate() {
        if is_fence(line) {
            in_fence = !in_fence;
        }
        let heading = if in_fence { None } else { heading_text(line) };
        if let Some(text) = heading {
            if i > current.start {
                current.end = i;
                sections.push(current);
            }
            current = Section {
                heading: Some(text.to_string()),
                start: i,
                end: i,
            };
        }
    }
    current.end = lines.len();
    if current.end > current.start {
        sections.push(current);
    }
    sections
}

/// Split a line into segments of at most `max_chars` characters.
fn split_long_line(line: &str, max_chars: usize) -> Vec<String> {
    if line.chars().count() <= max_chars {
        return vec![line.to_string()];
    }
    let chars: Vec<char> = line.chars().collect();
    chars
        .chunks(max_chars)
        .map(|segment| segment.iter().collect())
        .collect()
}

fn pack_section(
    lines: &[&str],
    first_line: usize,
    heading: Option<&str>,
    max_chars: usize,
    overlap_chars: usize,
    pieces: &mut Vec<Piece>,
) {
    // (segment text, 1-based line number, chars incl. newline)
    let mut buffer: Vec<(String, usize, usize)> = Vec::new();
    let mut buffer_chars = 0usize;

    for (offset, line) in lines.iter().enumerate() {
        let line_no = first_line + offset + 1;
        for segment in split_long_line(line, max_chars) {
            let size = segment.chars().count() + 1;
            if buffer_chars + size > max_chars && !buffer.is_empty() {
                flush(&buffer, heading, pieces);
                carry_overlap(&mut buffer, &mut buffer_chars, overlap_chars, size, max_chars);
            }
            buffer.push((segment, line_no, size));
            buffer_chars += size;
        }
    }
    flush(&buffer, heading, pieces);
}

fn flush(buffer: &[(String, usize, usize)], heading: Option<&str>, pieces: &mut Vec<Piece>) {
    let (Some(first), Some(last)) = (buffer.first(), buffer.last()) else {
        return;
    };
    let text = buffer
        .iter()
        .map(|(segment, _, _)| segment.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return;
    }
    pieces.push(Piece {
        text,
        start_line: first.1,
        end_line: last.1,
        heading: heading.map(str::to_string),
    });
}

/// Keep lines from the end of the flushed buffer until the overlap budget is
/// met, never keeping so much that the incoming segment would not fit.
fn carry_overlap(
    buffer: &mut Vec<(String, usize, usize)>,
    buffer_chars: &mut usize,
    overlap_chars: usize,
    incoming: usize,
    max_chars: usize,
) {
    let mut kept_chars = 0usize;
    let mut keep = 0usize;
    if overlap_chars > 0 {
        for (_, _, size) in buffer.iter().rev() {
            if kept_chars >= overlap_chars || kept_chars + size + incoming > max_chars {
                break;
            }
            kept_chars += size;
            keep += 1;
        }
    }
    let drop = buffer.len() - keep;
    buffer.drain(..drop);
    *buffer_chars = kept_chars;
}

fn make_chunk(source_value: &str, index: usize, total: usize, piece: Piece) -> DocumentChunk {
    let hash = hash_text(&piece.text);
    let id = hash_parts(&[source_value, &index.to_string(), &piece.text]);

    DocumentChunk {
        id,
        text: piece.text,
        hash,
        index,
        total,
        start_line: piece.start_line,
        end_line: piece.end_line,
        source_value: source_value.to_string(),
        heading_context: piece.heading,
    }
}
