//! # Knowledge Harness
//!
//! A persistent knowledge and memory layer for AI agents, on top of one
//! SQLite file per knowledge base.
//!
//! Bulk knowledge is chunked, embedded by a host-supplied provider,
//! deduplicated and stored with both a full-text and a vector index.
//! Agent memories go through an LLM-assisted consolidation step that
//! decides whether each new fact merges with, replaces, updates, sits next
//! to, or duplicates what is already stored.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────┐   ┌──────────────┐
//! │ ParsedDoc    │──▶│ Import pipeline           │──▶│ SQLite        │
//! │ (host parse) │   │ chunk → embed → dedup →   │   │ chunks + FTS5 │
//! └──────────────┘   │ store (+ incremental)     │   │ + vec0 / scan │
//!                    └───────────────────────────┘   └──────┬───────┘
//!                                                           │
//!                     ┌─────────────────────────────────────┤
//!                     ▼                                     ▼
//!              ┌──────────────┐                    ┌──────────────────┐
//!              │ Hybrid search│                    │ Consolidation    │
//!              │ vector + BM25│                    │ engine (LLM)     │
//!              └──────────────┘                    └──────────────────┘
//! ```
//!
//! Embeddings and LLM completions are never computed here: hosts implement
//! [`embedding::Embedder`] and [`llm::LlmClient`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and resolved consolidation limits |
//! | [`error`] | Typed error conditions |
//! | [`models`] | Core data types |
//! | [`hash`] | Content hashing and normalization |
//! | [`chunk`] | Heading-aware text chunking |
//! | [`embedding`] | Embedding contract and vector helpers |
//! | [`llm`] | LLM call contract |
//! | [`db`] | Database connection and vector extension probing |
//! | [`migrate`] | Schema migrations |
//! | [`vector`] | Native and brute-force vector indexes |
//! | [`store`] | Storage contract and in-memory store |
//! | [`sqlite_store`] | SQLite store |
//! | [`dedup`] | Hash and similarity deduplication |
//! | [`progress`] | Import progress events |
//! | [`ingest`] | Import pipeline |
//! | [`state`] | Import state sidecar file |
//! | [`incremental`] | Incremental import classification |
//! | [`search`] | Vector, keyword and hybrid search |
//! | [`locks`] | Keyed async mutexes |
//! | [`consolidation`] | LLM-assisted memory consolidation |

pub mod chunk;
pub mod config;
pub mod consolidation;
pub mod db;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod hash;
pub mod incremental;
pub mod ingest;
pub mod llm;
pub mod locks;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod search;
pub mod sqlite_store;
pub mod state;
pub mod store;
pub mod vector;
