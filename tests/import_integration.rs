//! End-to-end import tests against a real SQLite file.
//!
//! Everything runs on the brute-force vector backend with a deterministic
//! bag-of-words embedder, so no network access or native extension is
//! needed.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use knowledge_harness::config::Config;
use knowledge_harness::embedding::Embedder;
use knowledge_harness::incremental::{classify_source, reconcile_removed, IncrementalAction};
use knowledge_harness::ingest::{ImportOptions, ImportOutcome, ImportPipeline};
use knowledge_harness::migrate::{self, CURRENT_SCHEMA_VERSION};
use knowledge_harness::models::ParsedDocument;
use knowledge_harness::search::{search, SearchOptions};
use knowledge_harness::sqlite_store::SqliteStore;
use knowledge_harness::state::{ImportStateStore, ImportStatus};
use knowledge_harness::store::ChunkStore;
use knowledge_harness::vector::VectorBackend;
use tempfile::TempDir;

// ─── Test embedder ──────────────────────────────────────────────────

const DIMS: usize = 64;

/// Hashes each lowercase word into one of `DIMS` buckets.
struct BagOfWords;

fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        word.to_lowercase().hash(&mut hasher);
        v[(hasher.finish() % DIMS as u64) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for BagOfWords {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn config(tmp: &TempDir, extra: &str) -> Config {
    let content = format!(
        r#"[db]
path = "{}/kb.sqlite"
vector_extension = "knowledge_harness_missing_vec_extension"

[embedding]
model = "bag-of-words"

{}
"#,
        tmp.path().display(),
        extra
    );
    Config::from_toml_str(&content).unwrap()
}

async fn setup(tmp: &TempDir, extra: &str) -> (Config, Arc<SqliteStore>, ImportPipeline) {
    let config = config(tmp, extra);
    let store = Arc::new(SqliteStore::open(&config).await.unwrap());
    let pipeline = ImportPipeline::from_config(&config, store.clone(), Arc::new(BagOfWords));
    (config, store, pipeline)
}

fn guide() -> ParsedDocument {
    ParsedDocument::markdown(
        "docs/guide.md",
        "# Install\nDownload the installer and run it with administrator rights.\n\n\
         # Configure\nEdit settings.toml to point at your database cluster.\n\n\
         # Deploy\nShip containers to kubernetes using the helm chart.\n",
    )
}

fn long_notes(tail: &str) -> ParsedDocument {
    let mut body: Vec<String> = (0..24)
        .map(|i| format!("Paragraph {} covers topic{} with detail{} and example{}.", i, i, i, i))
        .collect();
    body.push(tail.to_string());
    ParsedDocument::markdown("notes/long.md", body.join("\n"))
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reimport_is_all_hash_duplicates() {
    let tmp = TempDir::new().unwrap();
    let (_config, store, pipeline) = setup(&tmp, "").await;
    let doc = guide();

    let first = pipeline.import(&doc, &ImportOptions::default()).await.unwrap();
    assert_eq!(first.status, ImportOutcome::Imported);
    assert!(first.chunks_stored >= 3, "got {}", first.chunks_stored);
    assert_eq!(first.chunks_skipped, 0);

    let second = pipeline.import(&doc, &ImportOptions::default()).await.unwrap();
    assert_eq!(second.status, ImportOutcome::Imported);
    assert_eq!(second.chunks_stored, 0);
    assert_eq!(second.chunks_skipped, first.chunks_stored);

    assert_eq!(
        store.count_by_source("docs/guide.md").await.unwrap(),
        first.chunks_stored as u64
    );
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.backend, VectorBackend::BruteForce);
    assert_eq!(stats.vector_dims, Some(DIMS));
    assert_eq!(stats.embedded, first.chunks_stored as i64);
}

#[tokio::test]
async fn test_dry_run_reports_would_be_counts() {
    let tmp = TempDir::new().unwrap();
    let (_config, store, pipeline) = setup(&tmp, "").await;

    let dry = ImportOptions {
        dry_run: true,
        ..ImportOptions::default()
    };
    let result = pipeline.import(&guide(), &dry).await.unwrap();
    assert_eq!(result.status, ImportOutcome::DryRun);
    assert_eq!(result.chunks_stored, 0);
    assert_eq!(store.count_by_source("docs/guide.md").await.unwrap(), 0);
    assert_eq!(store.stats().await.unwrap().chunks, 0);
}

#[tokio::test]
async fn test_changed_tail_only_rewrites_tail_chunks() {
    let tmp = TempDir::new().unwrap();
    let extra = r#"
[chunking]
max_tokens = 40
overlap_tokens = 10

[dedup]
similarity_dedup = false
"#;
    let (config, store, pipeline) = setup(&tmp, extra).await;
    let state = ImportStateStore::open(config.state_path());

    let v1 = long_notes("The closing paragraph says the release ships in March.");
    let first = pipeline
        .import_incremental(&v1, &state, &ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, ImportOutcome::Imported);
    assert!(first.chunks_stored > 3);
    let old_hashes = store.get_hashes_for_source("notes/long.md").await.unwrap();
    assert_eq!(old_hashes.len(), first.chunks_stored);

    let v2 = long_notes("The closing paragraph now says the release slipped to June.");
    assert_eq!(classify_source(&v2, &state).action, IncrementalAction::Changed);

    let second = pipeline
        .import_incremental(&v2, &state, &ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(second.status, ImportOutcome::Imported);

    let new_hashes = store.get_hashes_for_source("notes/long.md").await.unwrap();
    assert_eq!(new_hashes.len(), second.chunks_stored);
    assert_eq!(
        store.count_by_source("notes/long.md").await.unwrap(),
        second.chunks_stored as u64
    );

    let old: HashSet<&String> = old_hashes.iter().collect();
    let fresh: Vec<&String> = new_hashes.iter().filter(|h| !old.contains(h)).collect();
    assert!(!fresh.is_empty());
    assert!(fresh.len() <= 2, "{} chunks changed", fresh.len());
    // Only the trailing chunks differ; everything before is identical.
    let shared_prefix = old_hashes
        .iter()
        .zip(new_hashes.iter())
        .take_while(|(a, b)| a == b)
        .count();
    assert!(shared_prefix >= new_hashes.len() - 2);
    // The superseded tail is gone.
    let gone: Vec<&String> = old_hashes.iter().filter(|h| !new_hashes.contains(h)).collect();
    assert!(!gone.is_empty());
    for hash in gone {
        assert!(!store.has_hash(hash).await.unwrap());
    }

    let recorded = state.get("notes/long.md").unwrap();
    assert_eq!(recorded.content_hash, v2.content_hash);
    assert_eq!(recorded.chunk_count, second.chunks_stored);

    let third = pipeline
        .import_incremental(&v2, &state, &ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(third.status, ImportOutcome::Unchanged);
}

#[tokio::test]
async fn test_removed_source_is_retired_and_can_return() {
    let tmp = TempDir::new().unwrap();
    let (config, store, pipeline) = setup(&tmp, "").await;
    let state = ImportStateStore::open(config.state_path());
    let doc = guide();

    pipeline
        .import_incremental(&doc, &state, &ImportOptions::default())
        .await
        .unwrap();
    let removed = reconcile_removed(&HashSet::new(), &state, store.as_ref())
        .await
        .unwrap();
    assert_eq!(removed, vec!["docs/guide.md".to_string()]);
    assert_eq!(store.count_by_source("docs/guide.md").await.unwrap(), 0);
    assert_eq!(state.get("docs/guide.md").unwrap().status, ImportStatus::Removed);

    let back = pipeline
        .import_incremental(&doc, &state, &ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(back.status, ImportOutcome::Imported);
    assert!(back.chunks_stored > 0);
    assert_eq!(state.get("docs/guide.md").unwrap().status, ImportStatus::Original);
}

#[tokio::test]
async fn test_reopen_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (config, store, pipeline) = setup(&tmp, "").await;
    let stored = pipeline
        .import(&guide(), &ImportOptions::default())
        .await
        .unwrap()
        .chunks_stored;
    store.close().await;

    let reopened = SqliteStore::open(&config).await.unwrap();
    let again = SqliteStore::open(&config).await.unwrap();
    assert_eq!(
        migrate::schema_version(again.pool()).await.unwrap(),
        CURRENT_SCHEMA_VERSION
    );
    let fts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
        .fetch_one(again.pool())
        .await
        .unwrap();
    assert_eq!(fts, stored as i64);
    // Recorded dims survive a reopen without configured dims.
    assert_eq!(reopened.vector_dims(), Some(DIMS));
    reopened.close().await;
    again.close().await;
}

#[tokio::test]
async fn test_find_similar_on_empty_store_without_extension() {
    let tmp = TempDir::new().unwrap();
    let (_config, store, _pipeline) = setup(&tmp, "").await;
    assert_eq!(store.vector_backend(), VectorBackend::BruteForce);
    assert!(store
        .find_similar(&bag_of_words("anything at all"), 5)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_search_after_import() {
    let tmp = TempDir::new().unwrap();
    let (config, store, pipeline) = setup(&tmp, "").await;
    pipeline
        .import(&guide(), &ImportOptions::default())
        .await
        .unwrap();

    let options = SearchOptions::from(&config.retrieval);
    let results = search(&store, &BagOfWords, "kubernetes helm", &options)
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].path, "docs/guide.md");
    assert!(results[0].snippet.contains("kubernetes"));
    assert!(results.len() <= config.retrieval.final_limit);
}
