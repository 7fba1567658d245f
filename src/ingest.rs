//! Import pipeline orchestration.
//!
//! Runs one document through four ordered stages: chunking, embedding,
//! deduplication and storage. Each stage reports progress and checks the
//! caller's cancellation token at its boundary; embedding additionally
//! checks between batches. Batches are embedded sequentially so progress
//! is monotonic.
//!
//! Errors other than an abort never escape [`ImportPipeline::import`]:
//! they come back as an [`ImportResult`] with [`ImportOutcome::Failed`].
//! An abort is returned as `Err` carrying [`HarnessError::Aborted`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::{chunk_document, ChunkOptions};
use crate::config::Config;
use crate::dedup::{deduplicate_replacing, DedupOptions};
use crate::embedding::Embedder;
use crate::error::HarnessError;
use crate::incremental::{apply_incremental, classify_source, IncrementalAction};
use crate::locks::KeyedLocks;
use crate::models::{DocumentChunk, KnowledgeCategory, ParsedDocument};
use crate::progress::{ImportProgressEvent, ImportProgressReporter, ImportStage, NoProgress};
use crate::state::{ImportState, ImportStateStore, ImportStatus};
use crate::store::ChunkStore;

/// Per-call import switches.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Chunk and dedup only: no embedding calls, no writes.
    pub dry_run: bool,
    /// Cancelled by the caller to abort at the next stage boundary.
    pub signal: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportOutcome {
    Imported,
    DryRun,
    Failed,
    /// Incremental import found the source unchanged and did nothing.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub source: String,
    pub status: ImportOutcome,
    pub chunks_stored: usize,
    pub chunks_skipped: usize,
    pub content_hash: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Ids of the chunks written by this import.
    #[serde(skip)]
    pub chunk_ids: Vec<String>,
}

impl ImportResult {
    fn new(doc: &ParsedDocument, status: ImportOutcome, started: Instant) -> Self {
        Self {
            source: doc.source.value.clone(),
            status,
            chunks_stored: 0,
            chunks_skipped: 0,
            content_hash: doc.content_hash.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
            chunk_ids: Vec::new(),
        }
    }

    fn failed(doc: &ParsedDocument, started: Instant, err: &anyhow::Error) -> Self {
        Self {
            error: Some(format!("{:#}", err)),
            ..Self::new(doc, ImportOutcome::Failed, started)
        }
    }
}

/// What the stages produced, before it is folded into an [`ImportResult`].
struct StageReport {
    stored: Vec<String>,
    skipped: usize,
}

/// Chunk → embed → dedup → store for one document at a time.
pub struct ImportPipeline {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkOptions,
    dedup: DedupOptions,
    batch_size: usize,
    category: KnowledgeCategory,
    progress: Arc<dyn ImportProgressReporter>,
    locks: KeyedLocks,
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn ChunkStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            chunking: ChunkOptions::default(),
            dedup: DedupOptions::default(),
            batch_size: 50,
            category: KnowledgeCategory::default(),
            progress: Arc::new(NoProgress),
            locks: KeyedLocks::new(),
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self::new(store, embedder)
            .with_chunking(ChunkOptions::from(&config.chunking))
            .with_dedup(DedupOptions::from(&config.dedup))
            .with_batch_size(config.embedding.batch_size)
            .with_category(KnowledgeCategory::new(config.import.category.clone()))
    }

    pub fn with_chunking(mut self, chunking: ChunkOptions) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupOptions) -> Self {
        self.dedup = dedup;
        self
    }

    /// Texts per embedding call. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_category(mut self, category: KnowledgeCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ImportProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Import one document.
    pub async fn import(&self, doc: &ParsedDocument, options: &ImportOptions) -> Result<ImportResult> {
        let _guard = self.locks.lock(&doc.source.value).await;
        self.import_locked(doc, options, &HashSet::new()).await
    }

    /// Classify against `state`, skip unchanged sources, clear changed
    /// ones, import, and record the new state after a real import.
    /// Dry runs classify but never touch storage or state.
    pub async fn import_incremental(
        &self,
        doc: &ParsedDocument,
        state: &ImportStateStore,
        options: &ImportOptions,
    ) -> Result<ImportResult> {
        let started = Instant::now();
        let _guard = self.locks.lock(&doc.source.value).await;

        let classification = classify_source(doc, state);
        if classification.action == IncrementalAction::Unchanged {
            debug!(source = %doc.source.value, "source unchanged; skipping import");
            return Ok(ImportResult::new(doc, ImportOutcome::Unchanged, started));
        }

        // A dry run leaves the old chunks in place, so dedup must look past
        // them the way a real run would after deleting them.
        let mut replaced = HashSet::new();
        if options.dry_run {
            if classification.action == IncrementalAction::Changed {
                match self.store.get_hashes_for_source(&doc.source.value).await {
                    Ok(hashes) => replaced.extend(hashes),
                    Err(e) => return Ok(ImportResult::failed(doc, started, &e)),
                }
            }
        } else if let Err(e) = apply_incremental(&classification, self.store.as_ref()).await {
            warn!(source = %doc.source.value, error = %e, "incremental cleanup failed");
            return Ok(ImportResult::failed(doc, started, &e));
        }

        let mut result = self.import_locked(doc, options, &replaced).await?;
        if result.status == ImportOutcome::Imported {
            let record = ImportState {
                source_value: doc.source.value.clone(),
                source_type: doc.source.source_type,
                content_hash: doc.content_hash.clone(),
                status: ImportStatus::Original,
                last_imported_at: chrono::Utc::now(),
                chunk_count: result.chunk_ids.len(),
                chunk_ids: result.chunk_ids.clone(),
                label: doc.source.label.clone(),
            };
            if let Err(e) = state.upsert(record) {
                warn!(source = %doc.source.value, error = %e, "failed to record import state");
                result.status = ImportOutcome::Failed;
                result.error = Some(format!("{:#}", e));
            }
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    async fn import_locked(
        &self,
        doc: &ParsedDocument,
        options: &ImportOptions,
        replaced: &HashSet<String>,
    ) -> Result<ImportResult> {
        let started = Instant::now();
        match self.run_stages(doc, options, replaced).await {
            Ok(report) => {
                let status = if options.dry_run {
                    ImportOutcome::DryRun
                } else {
                    ImportOutcome::Imported
                };
                let mut result = ImportResult::new(doc, status, started);
                result.chunks_stored = report.stored.len();
                result.chunks_skipped = report.skipped;
                result.chunk_ids = report.stored;
                info!(
                    source = %result.source,
                    status = ?result.status,
                    stored = result.chunks_stored,
                    skipped = result.chunks_skipped,
                    duration_ms = result.duration_ms,
                    "import complete"
                );
                Ok(result)
            }
            Err(e) if HarnessError::is_abort(&e) => {
                info!(source = %doc.source.value, "import aborted");
                Err(e)
            }
            Err(e) => {
                warn!(source = %doc.source.value, error = %format!("{:#}", e), "import failed");
                Ok(ImportResult::failed(doc, started, &e))
            }
        }
    }

    async fn run_stages(
        &self,
        doc: &ParsedDocument,
        options: &ImportOptions,
        replaced: &HashSet<String>,
    ) -> Result<StageReport> {
        let label = doc.source.value.as_str();

        // Chunking
        check_abort(&options.signal, ImportStage::Chunking)?;
        self.report(ImportStage::Chunking, 0, 1, label);
        let chunks = chunk_document(doc, &self.chunking);
        let total = chunks.len() as u64;
        self.report(ImportStage::Chunking, 1, 1, label);

        // Embedding
        check_abort(&options.signal, ImportStage::Embedding)?;
        let embeddings = if options.dry_run {
            self.report(ImportStage::Embedding, total, total, label);
            vec![Vec::new(); chunks.len()]
        } else {
            self.embed_chunks(&chunks, &options.signal, label).await?
        };
        if let Some(dims) = embeddings.iter().map(Vec::len).find(|&n| n > 0) {
            self.store.ensure_schema(Some(dims)).await?;
        }

        // Dedup
        check_abort(&options.signal, ImportStage::Dedup)?;
        self.report(ImportStage::Dedup, 0, total, label);
        let outcome = deduplicate_replacing(
            chunks,
            embeddings,
            self.store.as_ref(),
            &self.dedup,
            replaced,
        )
        .await?;
        self.report(ImportStage::Dedup, total, total, label);
        let skipped = outcome.skipped();

        // Storing
        check_abort(&options.signal, ImportStage::Storing)?;
        let to_store = outcome.unique.len() as u64;
        self.report(ImportStage::Storing, 0, to_store, label);
        let mut stored = Vec::new();
        if !options.dry_run {
            for (i, unique) in outcome.unique.iter().enumerate() {
                self.store
                    .insert_chunk(&unique.chunk, &unique.embedding, &self.category)
                    .await?;
                stored.push(unique.chunk.id.clone());
                self.report(ImportStage::Storing, (i + 1) as u64, to_store, label);
            }
        } else {
            self.report(ImportStage::Storing, to_store, to_store, label);
        }

        Ok(StageReport { stored, skipped })
    }

    async fn embed_chunks(
        &self,
        chunks: &[DocumentChunk],
        signal: &CancellationToken,
        label: &str,
    ) -> Result<Vec<Vec<f32>>> {
        let total = chunks.len() as u64;
        let mut embeddings = Vec::with_capacity(chunks.len());
        self.report(ImportStage::Embedding, 0, total, label);

        for batch in chunks.chunks(self.batch_size) {
            check_abort(signal, ImportStage::Embedding)?;
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(HarnessError::EmbeddingCountMismatch {
                    expected: texts.len(),
                    actual: vectors.len(),
                }
                .into());
            }
            embeddings.extend(vectors);
            debug!(source = label, done = embeddings.len(), total, "embedding batch complete");
            self.report(ImportStage::Embedding, embeddings.len() as u64, total, label);
        }
        Ok(embeddings)
    }

    fn report(&self, stage: ImportStage, completed: u64, total: u64, label: &str) {
        self.progress.report(ImportProgressEvent {
            stage,
            completed,
            total,
            label: label.to_string(),
        });
    }
}

fn check_abort(signal: &CancellationToken, stage: ImportStage) -> Result<()> {
    if signal.is_cancelled() {
        return Err(HarnessError::aborted(stage.as_str()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Deterministic embedder: letter histogram, so equal text embeds equally.
    struct LetterEmbedder {
        calls: AtomicUsize,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl LetterEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl Embedder for LetterEmbedder {
        fn model_name(&self) -> &str {
            "letters"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, token)) = &self.cancel_after {
                if n >= *after {
                    token.cancel();
                }
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 26];
                    for c in t.chars().filter(|c| c.is_ascii_alphabetic()) {
                        v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "broken"
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("provider unavailable")
        }
    }

    fn three_sections() -> ParsedDocument {
        ParsedDocument::markdown(
            "guide.md",
            "# Install\nrun the installer\n# Configure\nedit settings quickly\n# Deploy\nship it to prod",
        )
    }

    #[tokio::test]
    async fn test_import_then_reimport_is_all_hash_duplicates() {
        let store = Arc::new(InMemoryStore::new("letters"));
        let pipeline = ImportPipeline::new(store.clone(), Arc::new(LetterEmbedder::new()));
        let doc = three_sections();

        let first = pipeline.import(&doc, &ImportOptions::default()).await.unwrap();
        assert_eq!(first.status, ImportOutcome::Imported);
        assert_eq!(first.chunks_stored, 3);
        assert_eq!(first.chunks_skipped, 0);
        assert_eq!(first.content_hash, doc.content_hash);

        let second = pipeline.import(&doc, &ImportOptions::default()).await.unwrap();
        assert_eq!(second.chunks_stored, 0);
        assert_eq!(second.chunks_skipped, 3);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_writing() {
        let store = Arc::new(InMemoryStore::new("letters"));
        let embedder = Arc::new(LetterEmbedder::new());
        let pipeline = ImportPipeline::new(store.clone(), embedder.clone());

        let result = pipeline
            .import(
                &three_sections(),
                &ImportOptions {
                    dry_run: true,
                    ..ImportOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, ImportOutcome::DryRun);
        assert_eq!(result.chunks_stored, 0);
        assert_eq!(result.chunks_skipped, 0);
        assert!(store.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_embedding_failure_becomes_failed_result() {
        let store = Arc::new(InMemoryStore::new("broken"));
        let pipeline = ImportPipeline::new(store.clone(), Arc::new(FailingEmbedder));
        let result = pipeline
            .import(&three_sections(), &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, ImportOutcome::Failed);
        assert!(result.error.unwrap().contains("provider unavailable"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_abort_before_start() {
        let store = Arc::new(InMemoryStore::new("letters"));
        let pipeline = ImportPipeline::new(store, Arc::new(LetterEmbedder::new()));
        let options = ImportOptions::default();
        options.signal.cancel();
        let err = pipeline.import(&three_sections(), &options).await.unwrap_err();
        assert!(HarnessError::is_abort(&err));
    }

    #[tokio::test]
    async fn test_abort_between_batches() {
        let token = CancellationToken::new();
        let embedder = Arc::new(LetterEmbedder {
            calls: AtomicUsize::new(0),
            cancel_after: Some((1, token.clone())),
        });
        let store = Arc::new(InMemoryStore::new("letters"));
        let pipeline =
            ImportPipeline::new(store.clone(), embedder.clone()).with_batch_size(1);

        let err = pipeline
            .import(
                &three_sections(),
                &ImportOptions {
                    dry_run: false,
                    signal: token,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Aborted { stage }) if stage == "embedding"
        ));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_ordered_and_monotonic() {
        let events: Arc<Mutex<Vec<ImportProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = move |event: ImportProgressEvent| sink.lock().unwrap().push(event);

        let store = Arc::new(InMemoryStore::new("letters"));
        let pipeline = ImportPipeline::new(store, Arc::new(LetterEmbedder::new()))
            .with_batch_size(2)
            .with_progress(Arc::new(reporter));
        pipeline
            .import(&three_sections(), &ImportOptions::default())
            .await
            .unwrap();

        let events = events.lock().unwrap();
        let stages: Vec<ImportStage> = events.iter().map(|e| e.stage).collect();
        let mut deduped = stages.clone();
        deduped.dedup();
        assert_eq!(
            deduped,
            vec![
                ImportStage::Chunking,
                ImportStage::Embedding,
                ImportStage::Dedup,
                ImportStage::Storing
            ]
        );

        let embedding: Vec<u64> = events
            .iter()
            .filter(|e| e.stage == ImportStage::Embedding)
            .map(|e| e.completed)
            .collect();
        assert_eq!(embedding, vec![0, 2, 3]);
        assert!(events.iter().all(|e| e.label == "guide.md"));
    }

    #[tokio::test]
    async fn test_incremental_skips_unchanged_and_records_state() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = ImportStateStore::open(tmp.path().join("state.json"));
        let store = Arc::new(InMemoryStore::new("letters"));
        let embedder = Arc::new(LetterEmbedder::new());
        let pipeline = ImportPipeline::new(store.clone(), embedder.clone());
        let doc = three_sections();

        let first = pipeline
            .import_incremental(&doc, &state, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(first.status, ImportOutcome::Imported);
        let recorded = state.get("guide.md").unwrap();
        assert_eq!(recorded.chunk_count, 3);
        assert_eq!(recorded.content_hash, doc.content_hash);
        assert_eq!(recorded.chunk_ids, first.chunk_ids);

        let calls = embedder.calls.load(Ordering::SeqCst);
        let second = pipeline
            .import_incremental(&doc, &state, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(second.status, ImportOutcome::Unchanged);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_incremental_dry_run_matches_real_run_counts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = ImportStateStore::open(tmp.path().join("state.json"));
        let store = Arc::new(InMemoryStore::new("letters"));
        let pipeline = ImportPipeline::new(store.clone(), Arc::new(LetterEmbedder::new()))
            .with_dedup(DedupOptions {
                similarity_dedup: false,
                ..DedupOptions::default()
            });

        pipeline
            .import_incremental(&three_sections(), &state, &ImportOptions::default())
            .await
            .unwrap();

        let v2 = ParsedDocument::markdown(
            "guide.md",
            "# Install\nrun the installer\n# Configure\nedit settings quickly\n# Deploy\nship it to staging",
        );
        let dry = pipeline
            .import_incremental(
                &v2,
                &state,
                &ImportOptions {
                    dry_run: true,
                    ..ImportOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(dry.status, ImportOutcome::DryRun);
        assert_eq!(store.len(), 3);
        assert_eq!(state.get("guide.md").unwrap().content_hash, three_sections().content_hash);

        let real = pipeline
            .import_incremental(&v2, &state, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(real.status, ImportOutcome::Imported);
        assert_eq!(real.chunks_skipped, 0);
        assert_eq!(real.chunks_stored, 3);
        assert_eq!(dry.chunks_skipped, real.chunks_skipped);
    }

    #[tokio::test]
    async fn test_failed_state_write_retries_next_time() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state_path = tmp.path().join("state.json");
        std::fs::create_dir(&state_path).unwrap();
        let state = ImportStateStore::open(&state_path);
        let store = Arc::new(InMemoryStore::new("letters"));
        let pipeline = ImportPipeline::new(store.clone(), Arc::new(LetterEmbedder::new()));
        let doc = three_sections();

        let first = pipeline
            .import_incremental(&doc, &state, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(first.status, ImportOutcome::Failed);
        assert!(first.error.is_some());
        assert!(state.get("guide.md").is_none());

        let second = pipeline
            .import_incremental(&doc, &state, &ImportOptions::default())
            .await
            .unwrap();
        assert_ne!(second.status, ImportOutcome::Unchanged);
    }
}
