//! Hybrid retrieval over the SQLite store.
//!
//! Two read-only paths produce the same [`SearchResult`] shape:
//!
//! - **vector**: cosine nearest neighbours through the store's active
//!   vector index (native or brute-force), `score = 1 - distance`.
//! - **keyword**: FTS5 BM25 over `chunks_fts`, the rank mapped onto
//!   `[0, 1)` by [`bm25_rank_to_score`].
//!
//! Both are scoped to the store's embedding model and optionally one
//! memory area. [`hybrid_search`] over-fetches from each path, blends the
//! scores with configured weights, and returns a deterministic ordering:
//! score descending, then id ascending.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::Row;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{embed_one, Embedder};
use crate::models::{MemoryArea, SearchResult, SearchSource};
use crate::sqlite_store::{chunk_details, SqliteStore};

/// Characters of chunk text used as the snippet for vector hits.
const VECTOR_SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    pub limit: usize,
    pub area: Option<MemoryArea>,
    pub vector_weight: f64,
    pub keyword_weight: f64,
    pub candidate_multiplier: usize,
    pub min_score: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for SearchOptions {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            limit: config.final_limit,
            area: None,
            vector_weight: config.vector_weight,
            keyword_weight: config.keyword_weight,
            candidate_multiplier: config.candidate_multiplier,
            min_score: config.min_score,
        }
    }
}

impl SearchOptions {
    fn candidate_limit(&self) -> usize {
        self.limit.saturating_mul(self.candidate_multiplier.max(1))
    }
}

/// Build an FTS5 MATCH expression: every alphanumeric token quoted and
/// AND-ed. `None` when the query has no tokens.
pub fn build_fts_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

/// Map an FTS5 `rank` (negative BM25, lower is better) to `[0, 1)`,
/// higher is better.
pub fn bm25_rank_to_score(rank: f64) -> f64 {
    if !rank.is_finite() {
        return 0.0;
    }
    let relevance = (-rank).max(0.0);
    relevance / (1.0 + relevance)
}

/// Nearest chunks to `query_vec` for the store's model.
pub async fn vector_search(
    store: &SqliteStore,
    query_vec: &[f32],
    limit: usize,
    area: Option<MemoryArea>,
) -> Result<Vec<SearchResult>> {
    if limit == 0 || query_vec.is_empty() {
        return Ok(Vec::new());
    }
    let matches = store.nearest(query_vec, limit, area).await?;
    let ids: Vec<String> = matches.iter().map(|m| m.chunk_id.clone()).collect();
    let details = chunk_details(store.pool(), &ids).await?;

    Ok(matches
        .into_iter()
        .filter_map(|m| {
            let chunk = details.get(&m.chunk_id)?;
            Some(SearchResult {
                id: chunk.id.clone(),
                path: chunk.path.clone(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                score: m.similarity,
                snippet: chunk.text.chars().take(VECTOR_SNIPPET_CHARS).collect(),
                source: SearchSource::Vector,
                area: chunk.area,
                importance: chunk.importance,
            })
        })
        .collect())
}

/// BM25-ranked chunks matching every token of `query`.
pub async fn keyword_search(
    store: &SqliteStore,
    query: &str,
    limit: usize,
    area: Option<MemoryArea>,
) -> Result<Vec<SearchResult>> {
    let Some(fts_query) = build_fts_query(query) else {
        return Ok(Vec::new());
    };
    if limit == 0 {
        return Ok(Vec::new());
    }

    let area = area.map(|a| a.as_str());
    let rows = sqlx::query(
        r#"
        SELECT id, rank,
               snippet(chunks_fts, 0, '>>>', '<<<', '...', 48) AS snippet
        FROM chunks_fts
        WHERE chunks_fts MATCH ?
          AND model = ?
          AND (? IS NULL OR area = ?)
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(&fts_query)
    .bind(store.model())
    .bind(area)
    .bind(area)
    .bind(limit as i64)
    .fetch_all(store.pool())
    .await
    .with_context(|| format!("Keyword search failed for query: {}", fts_query))?;

    let hits: Vec<(String, f64, String)> = rows
        .iter()
        .map(|row| (row.get("id"), row.get("rank"), row.get("snippet")))
        .collect();

    // Importance and line spans come from the primary table in a second
    // lookup; joining inside the FTS query skews its ranking.
    let ids: Vec<String> = hits.iter().map(|(id, _, _)| id.clone()).collect();
    let details = chunk_details(store.pool(), &ids).await?;

    Ok(hits
        .into_iter()
        .filter_map(|(id, rank, snippet)| {
            let chunk = details.get(&id)?;
            Some(SearchResult {
                id,
                path: chunk.path.clone(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                score: bm25_rank_to_score(rank),
                snippet,
                source: SearchSource::Keyword,
                area: chunk.area,
                importance: chunk.importance,
            })
        })
        .collect())
}

/// Blend vector and keyword results. Without a query vector only the
/// keyword path runs.
pub async fn hybrid_search(
    store: &SqliteStore,
    query: &str,
    query_vec: Option<&[f32]>,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    if options.limit == 0 {
        return Ok(Vec::new());
    }
    let candidates = options.candidate_limit();

    let vector = match query_vec {
        Some(v) => vector_search(store, v, candidates, options.area).await?,
        None => Vec::new(),
    };
    let keyword = keyword_search(store, query, candidates, options.area).await?;
    debug!(
        vector = vector.len(),
        keyword = keyword.len(),
        "hybrid search candidates"
    );

    Ok(merge_results(vector, keyword, options))
}

/// Embed `query` and run [`hybrid_search`]. An embedding failure degrades
/// to keyword-only retrieval.
pub async fn search(
    store: &SqliteStore,
    embedder: &dyn Embedder,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let query_vec = match embed_one(embedder, query).await {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "query embedding failed; falling back to keyword search");
            None
        }
    };
    hybrid_search(store, query, query_vec.as_deref(), options).await
}

fn merge_results(
    vector: Vec<SearchResult>,
    keyword: Vec<SearchResult>,
    options: &SearchOptions,
) -> Vec<SearchResult> {
    let mut merged: HashMap<String, (SearchResult, f64, f64)> = HashMap::new();

    for hit in vector {
        let score = hit.score;
        merged.insert(hit.id.clone(), (hit, score, 0.0));
    }
    for hit in keyword {
        let score = hit.score;
        match merged.get_mut(&hit.id) {
            Some((existing, _, k)) => {
                *k = score;
                existing.snippet = hit.snippet;
                existing.source = SearchSource::Hybrid;
            }
            None => {
                merged.insert(hit.id.clone(), (hit, 0.0, score));
            }
        }
    }

    let mut results: Vec<SearchResult> = merged
        .into_values()
        .map(|(mut result, v, k)| {
            result.score = options.vector_weight * v + options.keyword_weight * k;
            result
        })
        .filter(|r| r.score >= options.min_score)
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(options.limit);
    results
}
