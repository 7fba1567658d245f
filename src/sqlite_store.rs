//! SQLite-backed [`ChunkStore`] implementation.
//!
//! One database file holds `chunks` (the primary table, embeddings
//! included as packed BLOBs), `chunks_fts` (FTS5), `chunks_vec` (only when
//! the native vector extension is loaded), `meta` and `consolidation_log`.
//! Every write that touches more than one of those tables runs in a single
//! transaction.
//!
//! Beyond the [`ChunkStore`] contract this type carries the primitives the
//! consolidation engine and the search module need: memory inserts,
//! nearest-neighbour lookups scoped by area, atomic application of a
//! [`ConsolidationPlan`], the append-only decision log, and [`StoreStats`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::config::Config;
use crate::db::{self, Database};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::HarnessError;
use crate::hash::hash_text;
use crate::migrate;
use crate::models::{
    ConsolidationLogEntry, DocumentChunk, KnowledgeCategory, MemoryArea, MemoryRecord,
    SimilarChunk, SimilarMatch, StoredChunk, MEMORY_CATEGORY,
};
use crate::store::ChunkStore;
use crate::vector::{BruteForceIndex, SqliteVecIndex, VectorBackend, VectorFilter, VectorIndex};

const VECTOR_DIMS_KEY: &str = "vector_dims";

/// In-place rewrite of an existing memory.
#[derive(Debug, Clone)]
pub struct MemoryUpdate {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub consolidated_from: Vec<String>,
}

/// Every write one consolidation decision makes, applied atomically by
/// [`SqliteStore::apply_consolidation`].
#[derive(Debug, Clone)]
pub struct ConsolidationPlan {
    pub removals: Vec<String>,
    pub updates: Vec<MemoryUpdate>,
    pub inserts: Vec<MemoryRecord>,
    pub log: ConsolidationLogEntry,
}

/// Snapshot of what the store holds.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub chunks: i64,
    pub embedded: i64,
    pub sources: i64,
    pub memories_by_area: Vec<(MemoryArea, i64)>,
    pub consolidation_decisions: i64,
    pub backend: VectorBackend,
    pub vector_dims: Option<usize>,
    pub schema_version: i64,
}

/// Column values for one `chunks` row write.
struct RowWrite<'a> {
    id: &'a str,
    path: &'a str,
    category: &'a str,
    chunk_index: i64,
    total: i64,
    start_line: i64,
    end_line: i64,
    heading_context: Option<&'a str>,
    hash: &'a str,
    text: &'a str,
    embedding: &'a [f32],
    area: &'a str,
    importance: f64,
    consolidated_from: Option<String>,
}

/// SQLite implementation of [`ChunkStore`].
pub struct SqliteStore {
    pool: SqlitePool,
    model: String,
    index: Box<dyn VectorIndex>,
    dims: RwLock<Option<usize>>,
}

impl SqliteStore {
    /// Open the configured database, migrate it, and activate the vector
    /// index for `embedding.dims` if set.
    pub async fn open(config: &Config) -> Result<Self> {
        let database = db::connect(&config.db).await?;
        let store = Self::from_database(database, config.embedding.model.clone());
        store.ensure_schema(config.embedding.dims).await?;
        Ok(store)
    }

    /// Wrap an open database. Call [`ChunkStore::ensure_schema`] before use.
    pub fn from_database(database: Database, model: impl Into<String>) -> Self {
        let index: Box<dyn VectorIndex> = if database.native_vectors {
            Box::new(SqliteVecIndex)
        } else {
            Box::new(BruteForceIndex)
        };
        Self {
            pool: database.pool,
            model: model.into(),
            index,
            dims: RwLock::new(None),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Embedding model identity this store reads and writes.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn vector_backend(&self) -> VectorBackend {
        self.index.backend()
    }

    /// Active vector dimensionality, if any.
    pub fn vector_dims(&self) -> Option<usize> {
        *self.dims.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_dims(&self, dims: Option<usize>) {
        *self.dims.write().unwrap_or_else(PoisonError::into_inner) = dims;
    }

    /// Index used for reads. Without recorded dimensions there is no native
    /// table to query, so reads scan instead.
    fn read_index(&self) -> &dyn VectorIndex {
        if self.vector_dims().is_some() {
            self.index.as_ref()
        } else {
            &BruteForceIndex
        }
    }

    async fn recorded_dims(&self) -> Result<Option<usize>> {
        Ok(migrate::get_meta(&self.pool, VECTOR_DIMS_KEY)
            .await?
            .and_then(|v| v.parse::<usize>().ok()))
    }

    async fn native_table_missing(&self) -> Result<bool> {
        if self.index.backend() != VectorBackend::SqliteVec {
            return Ok(false);
        }
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='chunks_vec'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(tables == 0)
    }

    async fn write_row(&self, conn: &mut SqliteConnection, row: &RowWrite<'_>) -> Result<()> {
        let dims = self.vector_dims();
        if let Some(expected) = dims {
            if !row.embedding.is_empty() && row.embedding.len() != expected {
                return Err(HarnessError::DimensionMismatch {
                    expected,
                    actual: row.embedding.len(),
                }
                .into());
            }
        }

        let now = chrono::Utc::now().timestamp();
        let blob = if row.embedding.is_empty() {
            None
        } else {
            Some(vec_to_blob(row.embedding))
        };

        sqlx::query(
            r#"
            INSERT INTO chunks (id, path, category, chunk_index, total, start_line, end_line,
                                heading_context, hash, model, text, embedding, area, importance,
                                consolidated_from, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                category = excluded.category,
                chunk_index = excluded.chunk_index,
                total = excluded.total,
                start_line = excluded.start_line,
                end_line = excluded.end_line,
                heading_context = excluded.heading_context,
                hash = excluded.hash,
                model = excluded.model,
                text = excluded.text,
                embedding = excluded.embedding,
                area = excluded.area,
                importance = excluded.importance,
                consolidated_from = excluded.consolidated_from,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(row.id)
        .bind(row.path)
        .bind(row.category)
        .bind(row.chunk_index)
        .bind(row.total)
        .bind(row.start_line)
        .bind(row.end_line)
        .bind(row.heading_context)
        .bind(row.hash)
        .bind(&self.model)
        .bind(row.text)
        .bind(&blob)
        .bind(row.area)
        .bind(row.importance)
        .bind(&row.consolidated_from)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        reindex_fts(conn, row.id).await?;

        if dims.is_some() {
            if row.embedding.is_empty() {
                self.index.remove(conn, row.id).await?;
            } else {
                self.index.upsert(conn, row.id, row.embedding).await?;
            }
        }
        Ok(())
    }

    async fn remove_row(&self, conn: &mut SqliteConnection, id: &str) -> Result<u64> {
        if self.vector_dims().is_some() {
            self.index.remove(conn, id).await?;
        }
        sqlx::query("DELETE FROM chunks_fts WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        let deleted = sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    /// Store a memory written outside the import pipeline.
    pub async fn insert_memory(&self, record: &MemoryRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.write_memory(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_memory(&self, conn: &mut SqliteConnection, record: &MemoryRecord) -> Result<()> {
        if record.model != self.model {
            bail!(
                "memory model '{}' does not match store model '{}'",
                record.model,
                self.model
            );
        }
        let hash = hash_text(&record.text);
        let end_line = record.text.lines().count().max(1) as i64;
        self.write_row(
            conn,
            &RowWrite {
                id: &record.id,
                path: &record.path,
                category: MEMORY_CATEGORY,
                chunk_index: 0,
                total: 1,
                start_line: 1,
                end_line,
                heading_context: None,
                hash: &hash,
                text: &record.text,
                embedding: &record.embedding,
                area: record.area.as_str(),
                importance: record.importance,
                consolidated_from: encode_ids(&record.consolidated_from),
            },
        )
        .await
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<StoredChunk>> {
        let row = sqlx::query(
            r#"
            SELECT id, path, category, text, hash, model, area, importance, consolidated_from,
                   start_line, end_line, embedding
            FROM chunks WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(decode_chunk))
    }

    /// Nearest chunks for this store's model, optionally within one area.
    /// Scans when no vector index is active.
    pub async fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        area: Option<MemoryArea>,
    ) -> Result<Vec<SimilarMatch>> {
        let mut conn = self.pool.acquire().await?;
        self.read_index()
            .nearest(
                &mut conn,
                query,
                limit,
                VectorFilter {
                    model: Some(self.model.as_str()),
                    area: area.map(|a| a.as_str()),
                },
            )
            .await
    }

    /// Existing memories similar to `embedding`, most similar first.
    pub async fn similar_memories(
        &self,
        embedding: &[f32],
        limit: usize,
        area: Option<MemoryArea>,
    ) -> Result<Vec<SimilarChunk>> {
        let matches = self.nearest(embedding, limit, area).await?;
        let mut similar = Vec::with_capacity(matches.len());
        for m in matches {
            if let Some(chunk) = self.get_chunk(&m.chunk_id).await? {
                similar.push(SimilarChunk {
                    id: chunk.id,
                    text: chunk.text,
                    score: m.similarity,
                    path: chunk.path,
                    area: chunk.area,
                });
            }
        }
        Ok(similar)
    }

    /// Apply every write of one consolidation decision, and its log entry,
    /// in a single transaction. An update whose target no longer exists
    /// rolls the whole plan back.
    pub async fn apply_consolidation(&self, plan: &ConsolidationPlan) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for id in &plan.removals {
            self.remove_row(&mut tx, id).await?;
        }

        for update in &plan.updates {
            self.rewrite_memory(&mut tx, update).await?;
        }

        for record in &plan.inserts {
            self.write_memory(&mut tx, record).await?;
        }

        insert_log(&mut tx, &plan.log).await?;
        tx.commit().await.context("Failed to commit consolidation")?;

        debug!(
            action = %plan.log.action,
            removed = plan.removals.len(),
            updated = plan.updates.len(),
            inserted = plan.inserts.len(),
            "consolidation applied"
        );
        Ok(())
    }

    async fn rewrite_memory(&self, conn: &mut SqliteConnection, update: &MemoryUpdate) -> Result<()> {
        if let Some(expected) = self.vector_dims() {
            if update.embedding.len() != expected {
                return Err(HarnessError::DimensionMismatch {
                    expected,
                    actual: update.embedding.len(),
                }
                .into());
            }
        }
        let end_line = update.text.lines().count().max(1) as i64;
        let updated = sqlx::query(
            r#"
            UPDATE chunks
            SET text = ?, hash = ?, embedding = ?, end_line = ?, consolidated_from = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.text)
        .bind(hash_text(&update.text))
        .bind(vec_to_blob(&update.embedding))
        .bind(end_line)
        .bind(encode_ids(&update.consolidated_from))
        .bind(chrono::Utc::now().timestamp())
        .bind(&update.id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if updated == 0 {
            bail!("memory {} no longer exists", update.id);
        }

        reindex_fts(conn, &update.id).await?;
        if self.vector_dims().is_some() {
            self.index.upsert(conn, &update.id, &update.embedding).await?;
        }
        Ok(())
    }

    /// Logged decisions, newest first.
    pub async fn list_consolidation_log(
        &self,
        area: Option<MemoryArea>,
        limit: usize,
    ) -> Result<Vec<ConsolidationLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, action, source_ids, result_id, area, model, reasoning,
                   duration_ms, created_at
            FROM consolidation_log
            WHERE (? IS NULL OR area = ?)
            ORDER BY timestamp DESC, created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(area.map(|a| a.as_str()))
        .bind(area.map(|a| a.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let source_ids: String = row.get("source_ids");
                let area: String = row.get("area");
                ConsolidationLogEntry {
                    id: row.get("id"),
                    timestamp: row.get("timestamp"),
                    action: row.get("action"),
                    source_ids: serde_json::from_str(&source_ids).unwrap_or_default(),
                    result_id: row.get("result_id"),
                    area: area.parse().unwrap_or_default(),
                    model: row.get("model"),
                    reasoning: row.get("reasoning"),
                    duration_ms: row.get("duration_ms"),
                    created_at: row.get("created_at"),
                }
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embedded: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let sources: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT path) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let consolidation_decisions: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM consolidation_log")
                .fetch_one(&self.pool)
                .await?;

        let area_rows = sqlx::query(
            "SELECT area, COUNT(*) AS n FROM chunks WHERE category = ? GROUP BY area ORDER BY area",
        )
        .bind(MEMORY_CATEGORY)
        .fetch_all(&self.pool)
        .await?;
        let memories_by_area = area_rows
            .iter()
            .filter_map(|row| {
                let area: String = row.get("area");
                area.parse::<MemoryArea>()
                    .ok()
                    .map(|a| (a, row.get::<i64, _>("n")))
            })
            .collect();

        Ok(StoreStats {
            chunks,
            embedded,
            sources,
            memories_by_area,
            consolidation_decisions,
            backend: self.vector_backend(),
            vector_dims: self.vector_dims(),
            schema_version: migrate::schema_version(&self.pool).await?,
        })
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn ensure_schema(&self, dims: Option<usize>) -> Result<()> {
        migrate::ensure_schema(&self.pool).await?;

        let recorded = self.recorded_dims().await?;
        let target = dims.or(recorded);
        if let Some(d) = target {
            if recorded != Some(d) || self.native_table_missing().await? {
                let mut tx = self.pool.begin().await?;
                let indexed = self.index.rebuild(&mut tx, d).await?;
                migrate::set_meta(&mut tx, VECTOR_DIMS_KEY, &d.to_string()).await?;
                tx.commit().await?;
                info!(
                    dims = d,
                    previous = ?recorded,
                    indexed,
                    backend = %self.index.backend(),
                    "vector index rebuilt"
                );
            }
        }
        self.set_dims(target);
        Ok(())
    }

    async fn insert_chunk(
        &self,
        chunk: &DocumentChunk,
        embedding: &[f32],
        category: &KnowledgeCategory,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.write_row(
            &mut tx,
            &RowWrite {
                id: &chunk.id,
                path: &chunk.source_value,
                category: category.as_str(),
                chunk_index: chunk.index as i64,
                total: chunk.total as i64,
                start_line: chunk.start_line as i64,
                end_line: chunk.end_line as i64,
                heading_context: chunk.heading_context.as_deref(),
                hash: &chunk.hash,
                text: &chunk.text,
                embedding,
                area: MemoryArea::Main.as_str(),
                importance: 0.5,
                consolidated_from: None,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn has_hash(&self, hash: &str) -> Result<bool> {
        let found: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM chunks WHERE hash = ?)")
                .bind(hash)
                .fetch_one(&self.pool)
                .await?;
        Ok(found != 0)
    }

    async fn get_hashes_for_source(&self, source_value: &str) -> Result<Vec<String>> {
        let hashes: Vec<String> =
            sqlx::query_scalar("SELECT hash FROM chunks WHERE path = ? ORDER BY chunk_index, id")
                .bind(source_value)
                .fetch_all(&self.pool)
                .await?;
        Ok(hashes)
    }

    async fn find_similar(&self, embedding: &[f32], limit: usize) -> Result<Vec<SimilarMatch>> {
        if self.vector_dims().is_none() {
            return Ok(Vec::new());
        }
        self.nearest(embedding, limit, None).await
    }

    async fn delete_by_source(&self, source_value: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE path = ?")
            .bind(source_value)
            .fetch_all(&mut *tx)
            .await?;
        let mut deleted = 0;
        for id in &ids {
            deleted += self.remove_row(&mut tx, id).await?;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn count_by_source(&self, source_value: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE path = ?")
            .bind(source_value)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Replace a row's FTS entry with the current `chunks` values.
async fn reindex_fts(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM chunks_fts WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO chunks_fts (text, id, path, model, area, start_line, end_line)
        SELECT text, id, path, model, area, start_line, end_line FROM chunks WHERE id = ?
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_log(conn: &mut SqliteConnection, entry: &ConsolidationLogEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO consolidation_log (id, timestamp, action, source_ids, result_id, area, model,
                                       reasoning, duration_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.id)
    .bind(entry.timestamp)
    .bind(&entry.action)
    .bind(serde_json::to_string(&entry.source_ids)?)
    .bind(&entry.result_id)
    .bind(entry.area.as_str())
    .bind(&entry.model)
    .bind(&entry.reasoning)
    .bind(entry.duration_ms)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn encode_ids(ids: &[String]) -> Option<String> {
    if ids.is_empty() {
        None
    } else {
        serde_json::to_string(ids).ok()
    }
}

fn decode_chunk(row: &SqliteRow) -> StoredChunk {
    let area: String = row.get("area");
    let consolidated_from: Option<String> = row.get("consolidated_from");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    StoredChunk {
        id: row.get("id"),
        path: row.get("path"),
        category: row.get("category"),
        text: row.get("text"),
        hash: row.get("hash"),
        model: row.get("model"),
        area: area.parse().unwrap_or_default(),
        importance: row.get("importance"),
        consolidated_from: consolidated_from
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        embedding: embedding.map(|b| blob_to_vec(&b)),
    }
}

/// Chunk details keyed by id, for hydrating search candidates.
pub(crate) async fn chunk_details(
    pool: &SqlitePool,
    ids: &[String],
) -> Result<HashMap<String, StoredChunk>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        r#"
        SELECT id, path, category, text, hash, model, area, importance, consolidated_from,
               start_line, end_line, NULL AS embedding
        FROM chunks WHERE id IN ({})
        "#,
        placeholders
    );
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| {
            let chunk = decode_chunk(row);
            (chunk.id.clone(), chunk)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, ChunkOptions};
    use crate::config::DbConfig;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir, dims: Option<usize>) -> SqliteStore {
        let database = db::connect(&DbConfig {
            path: tmp.path().join("kb.sqlite"),
            vector_extension: String::new(),
        })
        .await
        .unwrap();
        let store = SqliteStore::from_database(database, "test-model");
        store.ensure_schema(dims).await.unwrap();
        store
    }

    fn memory(id: &str, text: &str, embedding: Vec<f32>, area: MemoryArea) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            text: text.to_string(),
            embedding,
            area,
            path: format!("memory/{}", id),
            model: "test-model".to_string(),
            importance: 0.5,
            consolidated_from: Vec::new(),
        }
    }

    fn log_entry(action: &str, area: MemoryArea, timestamp: i64) -> ConsolidationLogEntry {
        ConsolidationLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            action: action.to_string(),
            source_ids: vec!["a".to_string()],
            result_id: None,
            area,
            model: "llm".to_string(),
            reasoning: Some("because".to_string()),
            duration_ms: 3,
            created_at: timestamp,
        }
    }

    #[tokio::test]
    async fn test_find_similar_empty_store_without_extension() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, None).await;
        assert_eq!(store.vector_backend(), VectorBackend::BruteForce);
        assert!(store.find_similar(&[1.0, 0.0], 5).await.unwrap().is_empty());

        store.ensure_schema(Some(2)).await.unwrap();
        assert!(store.find_similar(&[1.0, 0.0], 5).await.unwrap().is_empty());
        assert!(store.find_similar(&[1.0, 0.0], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_and_source_queries() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Some(2)).await;
        let cat = KnowledgeCategory::default();
        let chunks = chunk_text("notes.md", "# A\nfirst\n# B\nsecond", &ChunkOptions::default());
        assert_eq!(chunks.len(), 2);
        store.insert_chunk(&chunks[0], &[1.0, 0.0], &cat).await.unwrap();
        store.insert_chunk(&chunks[1], &[0.0, 1.0], &cat).await.unwrap();
        // Upsert of the same id does not duplicate.
        store.insert_chunk(&chunks[1], &[0.0, 1.0], &cat).await.unwrap();

        assert_eq!(store.count_by_source("notes.md").await.unwrap(), 2);
        assert!(store.has_hash(&chunks[0].hash).await.unwrap());
        assert!(!store.has_hash("nope").await.unwrap());
        assert_eq!(
            store.get_hashes_for_source("notes.md").await.unwrap(),
            vec![chunks[0].hash.clone(), chunks[1].hash.clone()]
        );

        let hits = store.find_similar(&[1.0, 0.1], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, chunks[0].id);

        let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(fts_rows, 2);

        assert_eq!(store.delete_by_source("notes.md").await.unwrap(), 2);
        assert_eq!(store.count_by_source("notes.md").await.unwrap(), 0);
        let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(fts_rows, 0);
    }

    #[tokio::test]
    async fn test_dimension_change_and_mismatch() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Some(2)).await;
        let c = &chunk_text("a.md", "alpha", &ChunkOptions::default())[0];
        let err = store
            .insert_chunk(c, &[1.0, 0.0, 0.0], &KnowledgeCategory::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::DimensionMismatch { .. })
        ));

        store.ensure_schema(Some(3)).await.unwrap();
        assert_eq!(store.vector_dims(), Some(3));
        store
            .insert_chunk(c, &[1.0, 0.0, 0.0], &KnowledgeCategory::default())
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap().vector_dims, Some(3));

        // Recorded dims survive a reopen with no explicit dims.
        store.close().await;
        let reopened = open_store(&tmp, None).await;
        assert_eq!(reopened.vector_dims(), Some(3));
    }

    #[tokio::test]
    async fn test_apply_consolidation_is_atomic() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Some(2)).await;
        store
            .insert_memory(&memory("old", "the sky is green", vec![1.0, 0.0], MemoryArea::Main))
            .await
            .unwrap();

        // Update of a missing id fails and nothing else lands.
        let bad = ConsolidationPlan {
            removals: vec!["old".to_string()],
            updates: vec![MemoryUpdate {
                id: "ghost".to_string(),
                text: "x".to_string(),
                embedding: vec![1.0, 0.0],
                consolidated_from: Vec::new(),
            }],
            inserts: Vec::new(),
            log: log_entry("UPDATE", MemoryArea::Main, 1),
        };
        assert!(store.apply_consolidation(&bad).await.is_err());
        assert!(store.get_chunk("old").await.unwrap().is_some());
        assert!(store.list_consolidation_log(None, 10).await.unwrap().is_empty());

        let good = ConsolidationPlan {
            removals: vec!["old".to_string()],
            updates: Vec::new(),
            inserts: vec![memory("new", "the sky is blue", vec![0.9, 0.1], MemoryArea::Main)],
            log: log_entry("REPLACE", MemoryArea::Main, 2),
        };
        store.apply_consolidation(&good).await.unwrap();
        assert!(store.get_chunk("old").await.unwrap().is_none());
        let new = store.get_chunk("new").await.unwrap().unwrap();
        assert_eq!(new.category, MEMORY_CATEGORY);
        assert_eq!(new.text, "the sky is blue");

        let log = store.list_consolidation_log(None, 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, "REPLACE");
        assert_eq!(log[0].source_ids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_rewrite_memory_updates_fts_and_vectors() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Some(2)).await;
        store
            .insert_memory(&memory("m1", "coffee at nine", vec![1.0, 0.0], MemoryArea::Main))
            .await
            .unwrap();

        let plan = ConsolidationPlan {
            removals: Vec::new(),
            updates: vec![MemoryUpdate {
                id: "m1".to_string(),
                text: "tea at ten".to_string(),
                embedding: vec![0.0, 1.0],
                consolidated_from: vec!["m2".to_string()],
            }],
            inserts: Vec::new(),
            log: log_entry("UPDATE", MemoryArea::Main, 5),
        };
        store.apply_consolidation(&plan).await.unwrap();

        let chunk = store.get_chunk("m1").await.unwrap().unwrap();
        assert_eq!(chunk.text, "tea at ten");
        assert_eq!(chunk.hash, hash_text("tea at ten"));
        assert_eq!(chunk.consolidated_from, vec!["m2".to_string()]);

        let fts_hit: Option<String> =
            sqlx::query_scalar("SELECT id FROM chunks_fts WHERE chunks_fts MATCH 'tea'")
                .fetch_optional(store.pool())
                .await
                .unwrap();
        assert_eq!(fts_hit.as_deref(), Some("m1"));

        let hits = store
            .similar_memories(&[0.0, 1.0], 5, Some(MemoryArea::Main))
            .await
            .unwrap();
        assert_eq!(hits[0].id, "m1");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_similar_memories_scoped_by_area() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Some(2)).await;
        store
            .insert_memory(&memory("a", "main fact", vec![1.0, 0.0], MemoryArea::Main))
            .await
            .unwrap();
        store
            .insert_memory(&memory("b", "solution", vec![1.0, 0.0], MemoryArea::Solutions))
            .await
            .unwrap();

        let main = store
            .similar_memories(&[1.0, 0.0], 10, Some(MemoryArea::Main))
            .await
            .unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].id, "a");
        let all = store.similar_memories(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_log_is_newest_first_and_area_filtered() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Some(2)).await;
        for (ts, area) in [
            (10, MemoryArea::Main),
            (30, MemoryArea::Fragments),
            (20, MemoryArea::Main),
        ] {
            let plan = ConsolidationPlan {
                removals: Vec::new(),
                updates: Vec::new(),
                inserts: Vec::new(),
                log: log_entry("SKIP", area, ts),
            };
            store.apply_consolidation(&plan).await.unwrap();
        }

        let all = store.list_consolidation_log(None, 10).await.unwrap();
        let stamps: Vec<i64> = all.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![30, 20, 10]);

        let main = store
            .list_consolidation_log(Some(MemoryArea::Main), 1)
            .await
            .unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].timestamp, 20);
    }

    #[tokio::test]
    async fn test_stats() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, Some(2)).await;
        let c = &chunk_text("doc.md", "text", &ChunkOptions::default())[0];
        store
            .insert_chunk(c, &[], &KnowledgeCategory::default())
            .await
            .unwrap();
        store
            .insert_memory(&memory("m", "fact", vec![1.0, 0.0], MemoryArea::Solutions))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.embedded, 1);
        assert_eq!(stats.sources, 2);
        assert_eq!(stats.memories_by_area, vec![(MemoryArea::Solutions, 1)]);
        assert_eq!(stats.backend, VectorBackend::BruteForce);
        assert_eq!(stats.schema_version, migrate::CURRENT_SCHEMA_VERSION);
    }
}
