//! Sidecar import-state store.
//!
//! One JSON document per knowledge base records, for every imported
//! source, the content hash it was last imported with and the chunks that
//! import produced:
//!
//! ```json
//! { "version": 1, "sources": { "notes.md": { "sourceValue": "notes.md", ... } } }
//! ```
//!
//! The whole file is read into memory at open and rewritten on every
//! mutation by writing a temporary sibling and renaming it over the
//! original. A missing or unreadable file opens as an empty state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::SourceType;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    /// Present in the knowledge base.
    Original,
    /// Source disappeared; its chunks were removed.
    Removed,
}

/// What the last import of one source produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportState {
    pub source_value: String,
    pub source_type: SourceType,
    pub content_hash: String,
    pub status: ImportStatus,
    pub last_imported_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub chunk_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    sources: BTreeMap<String, ImportState>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            sources: BTreeMap::new(),
        }
    }
}

/// Keyed map of [`ImportState`] persisted as JSON.
pub struct ImportStateStore {
    path: PathBuf,
    state: Mutex<StateFile>,
}

impl ImportStateStore {
    /// Load the state file at `path`. Missing or corrupt files yield an
    /// empty state; nothing is written until the first mutation.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load(&path);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, source_value: &str) -> Option<ImportState> {
        self.lock().sources.get(source_value).cloned()
    }

    /// All tracked sources, ordered by source value.
    pub fn list(&self) -> Vec<ImportState> {
        self.lock().sources.values().cloned().collect()
    }

    pub fn upsert(&self, state: ImportState) -> Result<()> {
        self.update(|file| {
            file.sources.insert(state.source_value.clone(), state);
            true
        })
        .map(|_| ())
    }

    /// Flag a source as removed and clear its chunk references. Returns
    /// false when the source is not tracked.
    pub fn mark_removed(&self, source_value: &str) -> Result<bool> {
        self.update(|file| {
            let Some(entry) = file.sources.get_mut(source_value) else {
                return false;
            };
            entry.status = ImportStatus::Removed;
            entry.chunk_count = 0;
            entry.chunk_ids.clear();
            true
        })
    }

    /// Forget a source entirely. Returns false when it was not tracked.
    pub fn delete(&self, source_value: &str) -> Result<bool> {
        self.update(|file| file.sources.remove(source_value).is_some())
    }

    /// Apply `change` to a copy of the state and swap it in only once the
    /// copy is on disk. A failed write leaves the in-memory state as it was.
    fn update(&self, change: impl FnOnce(&mut StateFile) -> bool) -> Result<bool> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        persist(&self.path, &next)?;
        *guard = next;
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateFile> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load(path: &Path) -> StateFile {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StateFile::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "import state unreadable; starting empty");
            return StateFile::default();
        }
    };
    match serde_json::from_str::<StateFile>(&content) {
        Ok(state) if state.version == STATE_VERSION => state,
        Ok(state) => {
            warn!(
                path = %path.display(),
                version = state.version,
                "unsupported import state version; starting empty"
            );
            StateFile::default()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "import state corrupt; starting empty");
            StateFile::default()
        }
    }
}

fn persist(path: &Path, state: &StateFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }
    }

    let json = serde_json::to_string_pretty(state)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    std::fs::write(&tmp, json)
        .with_context(|| format!("Failed to write import state: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace import state: {}", path.display()))?;
    Ok(())
}
