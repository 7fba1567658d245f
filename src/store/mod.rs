//! Storage abstraction for imported knowledge.
//!
//! The [`ChunkStore`] trait is the contract the import pipeline, the
//! deduplicator and the incremental classifier program against. Two
//! backends implement it:
//!
//! - [`SqliteStore`](crate::sqlite_store::SqliteStore): the production
//!   store, one SQLite file with FTS5 and an optional native vector index.
//! - [`memory::InMemoryStore`]: a `HashMap`-backed store for tests and
//!   embedding hosts that do not persist.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{DocumentChunk, KnowledgeCategory, SimilarMatch};

/// Abstract chunk storage.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_schema`](ChunkStore::ensure_schema) | Create tables; (re)create the vector index on a dimension change |
/// | [`insert_chunk`](ChunkStore::insert_chunk) | Upsert a chunk row and its vector |
/// | [`has_hash`](ChunkStore::has_hash) | Exact-content lookup anywhere in storage |
/// | [`get_hashes_for_source`](ChunkStore::get_hashes_for_source) | Chunk hashes of one source, in chunk order |
/// | [`find_similar`](ChunkStore::find_similar) | Nearest neighbours by cosine distance |
/// | [`delete_by_source`](ChunkStore::delete_by_source) | Remove every chunk of a source |
/// | [`count_by_source`](ChunkStore::count_by_source) | Number of chunks of a source |
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Idempotently create the schema. When `dims` is given and differs
    /// from the recorded dimensionality, the stale vector index is dropped
    /// and rebuilt. `None` keeps whatever was recorded before.
    async fn ensure_schema(&self, dims: Option<usize>) -> Result<()>;

    /// Upsert a chunk. An empty `embedding` stores the row without a
    /// vector; so does a store with no active vector index.
    async fn insert_chunk(
        &self,
        chunk: &DocumentChunk,
        embedding: &[f32],
        category: &KnowledgeCategory,
    ) -> Result<()>;

    async fn has_hash(&self, hash: &str) -> Result<bool>;

    async fn get_hashes_for_source(&self, source_value: &str) -> Result<Vec<String>>;

    /// Up to `limit` nearest chunks for the store's model, ascending by
    /// distance. Returns an empty list when no vector index is active or
    /// `limit` is zero; never fails for a missing index.
    async fn find_similar(&self, embedding: &[f32], limit: usize) -> Result<Vec<SimilarMatch>>;

    /// Returns the number of rows deleted.
    async fn delete_by_source(&self, source_value: &str) -> Result<u64>;

    async fn count_by_source(&self, source_value: &str) -> Result<u64>;

    async fn close(&self);
}
