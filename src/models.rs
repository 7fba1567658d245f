//! Core data models used throughout the knowledge harness.
//!
//! These types represent the documents, chunks, memories and search results
//! that flow through the import, retrieval and consolidation pipelines.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash;

/// Kind of origin a parsed document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Url,
    Text,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Url => "url",
            SourceType::Text => "text",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a document came from. `value` is the stable key (path, URL, or a
/// caller-chosen name for inline text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSource {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Output of an external document parser. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedDocument {
    pub title: String,
    pub content: String,
    pub source: DocumentSource,
    pub content_hash: String,
    pub content_type: String,
    pub raw_byte_length: u64,
    pub fetched_at: DateTime<Utc>,
}

impl ParsedDocument {
    /// Build a document, deriving `content_hash` from the normalized content.
    pub fn new(
        title: impl Into<String>,
        content: impl Into<String>,
        source: DocumentSource,
        content_type: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            title: title.into(),
            content_hash: hash::content_hash(&content),
            raw_byte_length: content.len() as u64,
            content,
            source,
            content_type: content_type.into(),
            fetched_at: Utc::now(),
        }
    }

    /// Convenience constructor for inline Markdown text keyed by `value`.
    pub fn markdown(value: impl Into<String>, content: impl Into<String>) -> Self {
        let value = value.into();
        Self::new(
            value.clone(),
            content,
            DocumentSource {
                source_type: SourceType::Text,
                value,
                label: None,
            },
            "text/markdown",
        )
    }
}

/// A chunk of a document's text, produced by the chunker and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    /// Hash of source value, index and text: unique per position.
    pub id: String,
    pub text: String,
    /// Hash of the text alone: identical text shares it regardless of position.
    pub hash: String,
    pub index: usize,
    pub total: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub source_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_context: Option<String>,
}

/// Tag partitioning imported knowledge within one database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnowledgeCategory(pub String);

impl KnowledgeCategory {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for KnowledgeCategory {
    fn default() -> Self {
        Self("docs".to_string())
    }
}

impl fmt::Display for KnowledgeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Category recorded on rows written by the consolidation engine.
pub const MEMORY_CATEGORY: &str = "memory";

/// Coarse partition of the memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryArea {
    #[default]
    Main,
    Fragments,
    Solutions,
    Instruments,
}

impl MemoryArea {
    pub const ALL: [MemoryArea; 4] = [
        MemoryArea::Main,
        MemoryArea::Fragments,
        MemoryArea::Solutions,
        MemoryArea::Instruments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryArea::Main => "main",
            MemoryArea::Fragments => "fragments",
            MemoryArea::Solutions => "solutions",
            MemoryArea::Instruments => "instruments",
        }
    }
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryArea {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" => Ok(MemoryArea::Main),
            "fragments" => Ok(MemoryArea::Fragments),
            "solutions" => Ok(MemoryArea::Solutions),
            "instruments" => Ok(MemoryArea::Instruments),
            other => anyhow::bail!("unknown memory area: '{}'", other),
        }
    }
}

/// A nearest-neighbour hit from the adapter-level similarity lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarMatch {
    pub chunk_id: String,
    /// Cosine distance, `1 - similarity`.
    pub distance: f64,
    pub similarity: f64,
}

/// An existing memory shown to the consolidation engine. Transient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarChunk {
    pub id: String,
    pub text: String,
    pub score: f64,
    pub path: String,
    pub area: MemoryArea,
}

/// A row written by the consolidation engine.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub area: MemoryArea,
    pub path: String,
    pub model: String,
    pub importance: f64,
    /// Ids this entry was consolidated from, if any.
    pub consolidated_from: Vec<String>,
}

/// A full row of the `chunks` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub id: String,
    pub path: String,
    pub category: String,
    pub text: String,
    pub hash: String,
    pub model: String,
    pub area: MemoryArea,
    pub importance: f64,
    pub consolidated_from: Vec<String>,
    pub start_line: i64,
    pub end_line: i64,
    pub embedding: Option<Vec<f32>>,
}

/// Append-only audit record of one consolidation decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationLogEntry {
    pub id: String,
    /// When the decision was made (unix millis).
    pub timestamp: i64,
    pub action: String,
    pub source_ids: Vec<String>,
    pub result_id: Option<String>,
    pub area: MemoryArea,
    pub model: String,
    pub reasoning: Option<String>,
    pub duration_ms: i64,
    /// When the row was written (unix millis).
    pub created_at: i64,
}

/// Which retrieval path produced a search result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Vector,
    Keyword,
    Hybrid,
}

/// A search result returned from either retrieval path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub score: f64,
    pub snippet: String,
    pub source: SearchSource,
    pub area: MemoryArea,
    pub importance: f64,
}
