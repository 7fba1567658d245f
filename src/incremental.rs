//! Incremental import classification.
//!
//! [`classify_source`] compares a document's content hash against the
//! import state recorded for its source value. [`apply_incremental`]
//! turns that verdict into a go/no-go for the import pipeline, clearing the
//! old chunks first when a source changed so re-imports are never
//! additive. [`reconcile_removed`] retires sources that disappeared.

use std::collections::HashSet;

use anyhow::Result;
use tracing::{debug, info};

use crate::models::ParsedDocument;
use crate::state::{ImportStateStore, ImportStatus};
use crate::store::ChunkStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementalAction {
    New,
    Unchanged,
    Changed,
}

impl IncrementalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncrementalAction::New => "new",
            IncrementalAction::Unchanged => "unchanged",
            IncrementalAction::Changed => "changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub action: IncrementalAction,
    pub source_value: String,
    pub incoming_hash: String,
    pub stored_hash: Option<String>,
    pub previous_chunk_count: usize,
}

/// Classify `doc` against the recorded state. A source previously marked
/// removed counts as new: its chunks are gone.
pub fn classify_source(doc: &ParsedDocument, state: &ImportStateStore) -> ClassificationResult {
    let source_value = doc.source.value.clone();
    let incoming_hash = doc.content_hash.clone();

    let (action, stored_hash, previous_chunk_count) = match state.get(&source_value) {
        None => (IncrementalAction::New, None, 0),
        Some(prev) if prev.status == ImportStatus::Removed => {
            (IncrementalAction::New, Some(prev.content_hash), 0)
        }
        Some(prev) if prev.content_hash == incoming_hash => (
            IncrementalAction::Unchanged,
            Some(prev.content_hash),
            prev.chunk_count,
        ),
        Some(prev) => (
            IncrementalAction::Changed,
            Some(prev.content_hash),
            prev.chunk_count,
        ),
    };

    debug!(source = %source_value, action = action.as_str(), "source classified");
    ClassificationResult {
        action,
        source_value,
        incoming_hash,
        stored_hash,
        previous_chunk_count,
    }
}

/// Returns whether the import should proceed. Deletes the source's
/// existing chunks only for [`IncrementalAction::Changed`].
pub async fn apply_incremental(
    result: &ClassificationResult,
    store: &dyn ChunkStore,
) -> Result<bool> {
    match result.action {
        IncrementalAction::Unchanged => Ok(false),
        IncrementalAction::New => Ok(true),
        IncrementalAction::Changed => {
            let deleted = store.delete_by_source(&result.source_value).await?;
            info!(
                source = %result.source_value,
                deleted,
                previous = result.previous_chunk_count,
                "changed source cleared for re-import"
            );
            Ok(true)
        }
    }
}

/// Mark every tracked source missing from `present` as removed and delete
/// its chunks. Returns the retired source values.
pub async fn reconcile_removed(
    present: &HashSet<String>,
    state: &ImportStateStore,
    store: &dyn ChunkStore,
) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for entry in state.list() {
        if entry.status == ImportStatus::Removed || present.contains(&entry.source_value) {
            continue;
        }
        let deleted = store.delete_by_source(&entry.source_value).await?;
        state.mark_removed(&entry.source_value)?;
        info!(source = %entry.source_value, deleted, "removed source retired");
        removed.push(entry.source_value);
    }
    Ok(removed)
}
