//! Two-stage chunk deduplication.
//!
//! Exact duplicates are dropped first: a chunk whose content hash is
//! already in storage, or was already accepted earlier in the same batch,
//! never reaches the second stage. Survivors are then checked for near
//! duplicates: a chunk whose embedding has cosine similarity at or above
//! the threshold to its nearest stored neighbour, or to any chunk already
//! accepted from this batch, is dropped.
//!
//! Chunks with an empty embedding (dry runs) skip the similarity stage.

use std::collections::HashSet;

use anyhow::Result;
use tracing::debug;

use crate::config::DedupConfig;
use crate::embedding::cosine_similarity;
use crate::error::HarnessError;
use crate::models::DocumentChunk;
use crate::store::ChunkStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupOptions {
    pub hash_dedup: bool,
    pub similarity_dedup: bool,
    /// Cosine similarity at or above which a chunk is a near duplicate.
    pub similarity_threshold: f64,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self::from(&DedupConfig::default())
    }
}

impl From<&DedupConfig> for DedupOptions {
    fn from(config: &DedupConfig) -> Self {
        Self {
            hash_dedup: config.hash_dedup,
            similarity_dedup: config.similarity_dedup,
            similarity_threshold: config.similarity_threshold,
        }
    }
}

/// A chunk that survived deduplication, with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueChunk {
    pub chunk: DocumentChunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub unique: Vec<UniqueChunk>,
    pub hash_duplicates: usize,
    pub similarity_duplicates: usize,
}

impl DedupOutcome {
    pub fn skipped(&self) -> usize {
        self.hash_duplicates + self.similarity_duplicates
    }
}

/// Filter `chunks` (paired index-wise with `embeddings`) against `store`
/// and against each other.
pub async fn deduplicate(
    chunks: Vec<DocumentChunk>,
    embeddings: Vec<Vec<f32>>,
    store: &dyn ChunkStore,
    options: &DedupOptions,
) -> Result<DedupOutcome> {
    deduplicate_replacing(chunks, embeddings, store, options, &HashSet::new()).await
}

/// Like [`deduplicate`], but stored hashes in `replaced` count as absent.
/// Used to preview a re-import of a source whose old chunks would be
/// deleted first.
pub async fn deduplicate_replacing(
    chunks: Vec<DocumentChunk>,
    embeddings: Vec<Vec<f32>>,
    store: &dyn ChunkStore,
    options: &DedupOptions,
    replaced: &HashSet<String>,
) -> Result<DedupOutcome> {
    if chunks.len() != embeddings.len() {
        return Err(HarnessError::EmbeddingCountMismatch {
            expected: chunks.len(),
            actual: embeddings.len(),
        }
        .into());
    }

    let mut outcome = DedupOutcome::default();
    let mut seen_hashes: HashSet<String> = HashSet::new();

    for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
        if options.hash_dedup
            && (seen_hashes.contains(&chunk.hash)
                || (!replaced.contains(&chunk.hash) && store.has_hash(&chunk.hash).await?))
        {
            outcome.hash_duplicates += 1;
            continue;
        }

        if options.similarity_dedup
            && !embedding.is_empty()
            && is_near_duplicate(&embedding, &outcome.unique, store, options).await?
        {
            outcome.similarity_duplicates += 1;
            continue;
        }

        seen_hashes.insert(chunk.hash.clone());
        outcome.unique.push(UniqueChunk { chunk, embedding });
    }

    debug!(
        unique = outcome.unique.len(),
        hash_duplicates = outcome.hash_duplicates,
        similarity_duplicates = outcome.similarity_duplicates,
        "dedup complete"
    );
    Ok(outcome)
}

async fn is_near_duplicate(
    embedding: &[f32],
    accepted: &[UniqueChunk],
    store: &dyn ChunkStore,
    options: &DedupOptions,
) -> Result<bool> {
    let threshold = options.similarity_threshold;

    let in_batch = accepted.iter().any(|u| {
        !u.embedding.is_empty() && cosine_similarity(embedding, &u.embedding) as f64 >= threshold
    });
    if in_batch {
        return Ok(true);
    }

    let nearest = store.find_similar(embedding, 1).await?;
    Ok(nearest.first().is_some_and(|m| m.similarity >= threshold))
}
