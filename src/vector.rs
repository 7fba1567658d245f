//! Vector index backends.
//!
//! Embeddings are always kept as packed BLOBs in `chunks.embedding`; that
//! column is the primary copy. A [`VectorIndex`] answers nearest-neighbour
//! queries over it:
//!
//! - [`SqliteVecIndex`] mirrors the vectors into a sqlite-vec `vec0`
//!   virtual table (`chunks_vec`) and runs KNN there.
//! - [`BruteForceIndex`] scans `chunks.embedding` and computes cosine
//!   distance in Rust.
//!
//! The store picks one at open time. Both return the same
//! [`SimilarMatch`] shape, ascending by distance.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqliteConnection};
use std::fmt;
use tracing::debug;

use crate::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use crate::models::SimilarMatch;

/// Native KNN over-fetch factor when results are filtered after the scan.
const FILTER_OVERSAMPLE: usize = 4;

/// Largest `k` a vec0 KNN query accepts.
const VEC0_MAX_K: usize = 4096;

/// Next `k` for a filtered KNN that returned `found < limit` rows out of
/// `indexed` vectors. `None` once the whole index has been searched;
/// `Some(k)` above [`VEC0_MAX_K`] means the native query cannot go wider.
fn widen_k(k: usize, limit: usize, found: usize, indexed: usize) -> Option<usize> {
    if found >= limit || k >= indexed {
        return None;
    }
    Some(k.saturating_mul(FILTER_OVERSAMPLE).min(indexed))
}

/// Which backend answers nearest-neighbour queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    SqliteVec,
    BruteForce,
}

impl fmt::Display for VectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorBackend::SqliteVec => f.write_str("sqlite-vec"),
            VectorBackend::BruteForce => f.write_str("brute-force"),
        }
    }
}

/// Row filter applied to nearest-neighbour results.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorFilter<'a> {
    pub model: Option<&'a str>,
    pub area: Option<&'a str>,
}

impl VectorFilter<'_> {
    fn is_empty(&self) -> bool {
        self.model.is_none() && self.area.is_none()
    }
}

/// A nearest-neighbour backend. Every method takes a connection so it can
/// run inside the caller's transaction.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn backend(&self) -> VectorBackend;

    /// Drop and recreate the index for `dims`, backfilling from stored
    /// embeddings of that length. Returns the number of vectors indexed.
    async fn rebuild(&self, conn: &mut SqliteConnection, dims: usize) -> Result<u64>;

    async fn upsert(&self, conn: &mut SqliteConnection, chunk_id: &str, embedding: &[f32])
        -> Result<()>;

    async fn remove(&self, conn: &mut SqliteConnection, chunk_id: &str) -> Result<()>;

    /// Up to `limit` nearest chunks, ascending by cosine distance.
    async fn nearest(
        &self,
        conn: &mut SqliteConnection,
        query: &[f32],
        limit: usize,
        filter: VectorFilter<'_>,
    ) -> Result<Vec<SimilarMatch>>;
}

fn to_match(chunk_id: String, distance: f64) -> SimilarMatch {
    SimilarMatch {
        chunk_id,
        distance,
        similarity: 1.0 - distance,
    }
}

fn sort_matches(matches: &mut [SimilarMatch]) {
    matches.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// sqlite-vec backed index over the `chunks_vec` virtual table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteVecIndex;

#[async_trait]
impl VectorIndex for SqliteVecIndex {
    fn backend(&self) -> VectorBackend {
        VectorBackend::SqliteVec
    }

    async fn rebuild(&self, conn: &mut SqliteConnection, dims: usize) -> Result<u64> {
        sqlx::query("DROP TABLE IF EXISTS chunks_vec")
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!(
            "CREATE VIRTUAL TABLE chunks_vec USING vec0(
                chunk_id TEXT PRIMARY KEY,
                embedding float[{}] distance_metric=cosine
            )",
            dims
        ))
        .execute(&mut *conn)
        .await
        .context("Failed to create chunks_vec table")?;

        let backfilled = sqlx::query(
            r#"
            INSERT INTO chunks_vec (chunk_id, embedding)
            SELECT id, embedding FROM chunks
            WHERE embedding IS NOT NULL AND length(embedding) = ?
            "#,
        )
        .bind((dims * 4) as i64)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(backfilled)
    }

    async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        chunk_id: &str,
        embedding: &[f32],
    ) -> Result<()> {
        // vec0 has no ON CONFLICT support.
        sqlx::query("DELETE FROM chunks_vec WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("INSERT INTO chunks_vec (chunk_id, embedding) VALUES (?, ?)")
            .bind(chunk_id)
            .bind(vec_to_blob(embedding))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, conn: &mut SqliteConnection, chunk_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks_vec WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn nearest(
        &self,
        conn: &mut SqliteConnection,
        query: &[f32],
        limit: usize,
        filter: VectorFilter<'_>,
    ) -> Result<Vec<SimilarMatch>> {
        if limit == 0 || query.is_empty() {
            return Ok(Vec::new());
        }
        if filter.is_empty() && limit <= VEC0_MAX_K {
            return knn(conn, query, limit, limit, filter).await;
        }

        // Filtering happens after the KNN, so widen `k` until enough rows
        // survive or the whole index has been searched.
        let indexed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_vec")
            .fetch_one(&mut *conn)
            .await?;
        let indexed = indexed.max(0) as usize;
        let mut k = limit.saturating_mul(FILTER_OVERSAMPLE).min(indexed.max(1));
        loop {
            if k > VEC0_MAX_K {
                debug!(k, indexed, "filtered KNN exceeds vec0 limit; scanning");
                return BruteForceIndex.nearest(conn, query, limit, filter).await;
            }
            let matches = knn(conn, query, k, limit, filter).await?;
            match widen_k(k, limit, matches.len(), indexed) {
                Some(next) => k = next,
                None => return Ok(matches),
            }
        }
    }
}

/// One vec0 KNN pass: the `k` nearest vectors, filtered, capped at `limit`.
async fn knn(
    conn: &mut SqliteConnection,
    query: &[f32],
    k: usize,
    limit: usize,
    filter: VectorFilter<'_>,
) -> Result<Vec<SimilarMatch>> {
    let rows = sqlx::query(
        r#"
        SELECT knn.chunk_id AS chunk_id, knn.distance AS distance
        FROM (
            SELECT chunk_id, distance FROM chunks_vec
            WHERE embedding MATCH ? AND k = ?
        ) knn
        JOIN chunks c ON c.id = knn.chunk_id
        WHERE (? IS NULL OR c.model = ?)
          AND (? IS NULL OR c.area = ?)
        ORDER BY knn.distance ASC, knn.chunk_id ASC
        LIMIT ?
        "#,
    )
    .bind(vec_to_blob(query))
    .bind(k as i64)
    .bind(filter.model)
    .bind(filter.model)
    .bind(filter.area)
    .bind(filter.area)
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    let mut matches: Vec<SimilarMatch> = rows
        .iter()
        .map(|row| to_match(row.get("chunk_id"), row.get("distance")))
        .collect();
    sort_matches(&mut matches);
    Ok(matches)
}

/// Linear cosine scan over `chunks.embedding`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BruteForceIndex;

#[async_trait]
impl VectorIndex for BruteForceIndex {
    fn backend(&self) -> VectorBackend {
        VectorBackend::BruteForce
    }

    async fn rebuild(&self, conn: &mut SqliteConnection, dims: usize) -> Result<u64> {
        let indexed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL AND length(embedding) = ?",
        )
        .bind((dims * 4) as i64)
        .fetch_one(&mut *conn)
        .await?;
        Ok(indexed as u64)
    }

    async fn upsert(&self, _: &mut SqliteConnection, _: &str, _: &[f32]) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _: &mut SqliteConnection, _: &str) -> Result<()> {
        Ok(())
    }

    async fn nearest(
        &self,
        conn: &mut SqliteConnection,
        query: &[f32],
        limit: usize,
        filter: VectorFilter<'_>,
    ) -> Result<Vec<SimilarMatch>> {
        if limit == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, embedding FROM chunks
            WHERE embedding IS NOT NULL
              AND length(embedding) = ?
              AND (? IS NULL OR model = ?)
              AND (? IS NULL OR area = ?)
            "#,
        )
        .bind((query.len() * 4) as i64)
        .bind(filter.model)
        .bind(filter.model)
        .bind(filter.area)
        .bind(filter.area)
        .fetch_all(&mut *conn)
        .await?;

        let mut matches: Vec<SimilarMatch> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                to_match(row.get("id"), cosine_distance(query, &vec))
            })
            .collect();

        sort_matches(&mut matches);
        matches.truncate(limit);
        Ok(matches)
    }
}
