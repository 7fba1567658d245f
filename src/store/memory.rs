//! In-memory [`ChunkStore`] implementation for tests and non-persistent hosts.
//!
//! Rows live in a `HashMap` behind `std::sync::RwLock`. Vector lookups are
//! brute-force cosine scans, the same semantics as the SQLite store's
//! fallback backend.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::error::HarnessError;
use crate::models::{DocumentChunk, KnowledgeCategory, SimilarMatch};

use super::ChunkStore;

struct StoredRow {
    chunk: DocumentChunk,
    category: String,
    embedding: Option<Vec<f32>>,
}

/// In-memory store keyed by chunk id.
pub struct InMemoryStore {
    model: String,
    dims: RwLock<Option<usize>>,
    rows: RwLock<HashMap<String, StoredRow>>,
}

impl InMemoryStore {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            dims: RwLock::new(None),
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Total number of stored chunks.
    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Category a chunk was stored under.
    pub fn category_of(&self, chunk_id: &str) -> Option<String> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chunk_id)
            .map(|row| row.category.clone())
    }

    fn dims(&self) -> Option<usize> {
        *self.dims.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn ensure_schema(&self, dims: Option<usize>) -> Result<()> {
        if let Some(d) = dims {
            *self.dims.write().unwrap_or_else(PoisonError::into_inner) = Some(d);
        }
        Ok(())
    }

    async fn insert_chunk(
        &self,
        chunk: &DocumentChunk,
        embedding: &[f32],
        category: &KnowledgeCategory,
    ) -> Result<()> {
        // Vectors stored before dims are known become searchable once
        // `ensure_schema` records a matching dimension.
        let embedding = match self.dims() {
            _ if embedding.is_empty() => None,
            Some(d) if d != embedding.len() => {
                return Err(HarnessError::DimensionMismatch {
                    expected: d,
                    actual: embedding.len(),
                }
                .into());
            }
            _ => Some(embedding.to_vec()),
        };

        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.insert(
            chunk.id.clone(),
            StoredRow {
                chunk: chunk.clone(),
                category: category.as_str().to_string(),
                embedding,
            },
        );
        Ok(())
    }

    async fn has_hash(&self, hash: &str) -> Result<bool> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.values().any(|row| row.chunk.hash == hash))
    }

    async fn get_hashes_for_source(&self, source_value: &str) -> Result<Vec<String>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut chunks: Vec<&DocumentChunk> = rows
            .values()
            .map(|row| &row.chunk)
            .filter(|c| c.source_value == source_value)
            .collect();
        chunks.sort_by_key(|c| c.index);
        Ok(chunks.into_iter().map(|c| c.hash.clone()).collect())
    }

    async fn find_similar(&self, embedding: &[f32], limit: usize) -> Result<Vec<SimilarMatch>> {
        if limit == 0 || embedding.is_empty() || self.dims().is_none() {
            return Ok(Vec::new());
        }
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<SimilarMatch> = rows
            .values()
            .filter_map(|row| {
                let stored = row.embedding.as_ref()?;
                if stored.len() != embedding.len() {
                    return None;
                }
                let distance = cosine_distance(embedding, stored);
                Some(SimilarMatch {
                    chunk_id: row.chunk.id.clone(),
                    distance,
                    similarity: 1.0 - distance,
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete_by_source(&self, source_value: &str) -> Result<u64> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|_, row| row.chunk.source_value != source_value);
        Ok((before - rows.len()) as u64)
    }

    async fn count_by_source(&self, source_value: &str) -> Result<u64> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .values()
            .filter(|row| row.chunk.source_value == source_value)
            .count() as u64)
    }

    async fn close(&self) {}
}
