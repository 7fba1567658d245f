//! LLM-assisted memory consolidation.
//!
//! Every new memory goes through one decision:
//!
//! | Action | Writes |
//! |--------|--------|
//! | `MERGE` | one new combined entry; listed candidates removed |
//! | `REPLACE` | target removed, new memory stored in its place |
//! | `KEEP_SEPARATE` | new memory stored as-is |
//! | `UPDATE` | candidates rewritten in place; new memory stored only on request |
//! | `SKIP` | nothing |
//!
//! The engine looks up similar memories in the same area, asks the model,
//! parses the answer with [`parse_consolidation_response`], checks the
//! decision against the candidate set, and applies it together with its
//! log entry in one transaction. Decisions in one area are serialized.

mod prompt;
mod response;

pub use prompt::{build_user_prompt, SYSTEM_PROMPT};
pub use response::{
    parse_consolidation_response, ConsolidationAction, MemoryEdit, ParsedConsolidationResponse,
};

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResolvedConsolidation;
use crate::embedding::{embed_one, Embedder};
use crate::error::HarnessError;
use crate::llm::{LlmClient, LlmRequest, LlmTaskType};
use crate::locks::KeyedLocks;
use crate::models::{ConsolidationLogEntry, MemoryRecord, SimilarChunk};
use crate::sqlite_store::{ConsolidationPlan, MemoryUpdate, SqliteStore};

/// Candidate cap when `max_similar_memories` resolves to unlimited.
const UNLIMITED_CANDIDATES: usize = 1024;

/// What one decision did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationOutcome {
    pub action: ConsolidationAction,
    /// Entry that now holds the new information, if any.
    pub result_id: Option<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub inserted: Vec<String>,
    pub reasoning: String,
    /// The model's answer was unusable (or the call failed).
    pub fallback: bool,
    pub log_id: String,
    pub duration_ms: i64,
}

pub struct ConsolidationEngine {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmClient>,
    settings: ResolvedConsolidation,
    locks: KeyedLocks,
}

impl ConsolidationEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
        settings: ResolvedConsolidation,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    pub fn settings(&self) -> &ResolvedConsolidation {
        &self.settings
    }

    /// Decide what to do with `memory` and apply it.
    ///
    /// LLM failures and unreadable answers store the memory as
    /// `KEEP_SEPARATE`. Only a cancelled `signal` or a storage failure
    /// returns `Err`.
    pub async fn process_new_chunk(
        &self,
        memory: MemoryRecord,
        signal: &CancellationToken,
    ) -> Result<ConsolidationOutcome> {
        let started = Instant::now();
        check_abort(signal)?;
        let _guard = self.locks.lock(memory.area.as_str()).await;

        let (candidates, decision) = if !self.settings.enabled {
            (
                Vec::new(),
                ParsedConsolidationResponse::keep_separate("consolidation disabled"),
            )
        } else {
            let candidates = self.find_candidates(&memory).await?;
            let decision = if candidates.is_empty() {
                ParsedConsolidationResponse {
                    fallback: false,
                    ..ParsedConsolidationResponse::keep_separate("no similar memories")
                }
            } else {
                self.ask_llm(&memory, &candidates, signal).await?
            };
            (candidates, decision)
        };

        let decision = guard_decision(decision, &candidates, self.settings.replace_threshold);
        check_abort(signal)?;

        let writes = self.build_writes(&memory, &candidates, &decision).await?;
        let now = Utc::now().timestamp_millis();
        let duration_ms = started.elapsed().as_millis() as i64;
        let log = ConsolidationLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now,
            action: decision.action.as_str().to_string(),
            source_ids: writes.source_ids.clone(),
            result_id: writes.result_id.clone(),
            area: memory.area,
            model: self.llm.model_name().to_string(),
            reasoning: Some(decision.reasoning.clone()).filter(|r| !r.is_empty()),
            duration_ms,
            created_at: now,
        };
        let log_id = log.id.clone();

        let plan = ConsolidationPlan {
            removals: writes.removals.clone(),
            updates: writes.updates,
            inserts: writes.inserts,
            log,
        };
        self.store.apply_consolidation(&plan).await?;

        info!(
            action = %decision.action,
            area = memory.area.as_str(),
            memory = %memory.id,
            result = ?writes.result_id,
            candidates = candidates.len(),
            fallback = decision.fallback,
            duration_ms,
            "consolidation decision applied"
        );

        Ok(ConsolidationOutcome {
            action: decision.action,
            result_id: writes.result_id,
            removed: writes.removals,
            updated: plan.updates.iter().map(|u| u.id.clone()).collect(),
            inserted: plan.inserts.iter().map(|r| r.id.clone()).collect(),
            reasoning: decision.reasoning,
            fallback: decision.fallback,
            log_id,
            duration_ms,
        })
    }

    /// Similar memories in the same area above the candidacy floor, best
    /// first, capped at the LLM context limit.
    async fn find_candidates(&self, memory: &MemoryRecord) -> Result<Vec<SimilarChunk>> {
        let limit = self
            .settings
            .max_similar_memories
            .unwrap_or(UNLIMITED_CANDIDATES);
        let mut candidates: Vec<SimilarChunk> = self
            .store
            .similar_memories(&memory.embedding, limit, Some(memory.area))
            .await?
            .into_iter()
            .filter(|c| c.id != memory.id && c.score >= self.settings.similarity_threshold)
            .collect();
        if let Some(max) = self.settings.max_llm_context_memories {
            candidates.truncate(max);
        }
        debug!(memory = %memory.id, candidates = candidates.len(), "consolidation candidates");
        Ok(candidates)
    }

    async fn ask_llm(
        &self,
        memory: &MemoryRecord,
        candidates: &[SimilarChunk],
        signal: &CancellationToken,
    ) -> Result<ParsedConsolidationResponse> {
        let request = LlmRequest {
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_prompt: build_user_prompt(memory, candidates, Utc::now()),
            task_type: LlmTaskType::MemoryConsolidation,
            signal: signal.clone(),
        };

        let response = tokio::select! {
            _ = signal.cancelled() => return Err(HarnessError::aborted("consolidation").into()),
            response = self.llm.call(request) => response,
        };

        match response {
            Ok(raw) => {
                let parsed = parse_consolidation_response(&raw);
                if parsed.fallback {
                    warn!(memory = %memory.id, reason = %parsed.reasoning, "unusable consolidation response");
                }
                Ok(parsed)
            }
            Err(_) if signal.is_cancelled() => Err(HarnessError::aborted("consolidation").into()),
            Err(e) => {
                warn!(memory = %memory.id, error = %e, "consolidation LLM call failed");
                Ok(ParsedConsolidationResponse::keep_separate(format!(
                    "fallback: LLM call failed: {}",
                    e
                )))
            }
        }
    }

    async fn build_writes(
        &self,
        memory: &MemoryRecord,
        candidates: &[SimilarChunk],
        decision: &ParsedConsolidationResponse,
    ) -> Result<Writes> {
        let mut writes = Writes {
            source_ids: vec![memory.id.clone()],
            ..Writes::default()
        };

        match decision.action {
            ConsolidationAction::KeepSeparate => {
                writes.inserts.push(memory.clone());
                writes.result_id = Some(memory.id.clone());
            }
            ConsolidationAction::Skip => {
                writes.source_ids.extend(candidates.iter().map(|c| c.id.clone()));
            }
            ConsolidationAction::Merge => {
                let text = decision
                    .new_memory_content
                    .clone()
                    .unwrap_or_else(|| memory.text.clone());
                let embedding = self.embed_content(&text, memory).await;
                let id = uuid::Uuid::new_v4().to_string();
                let mut consolidated_from = vec![memory.id.clone()];
                consolidated_from.extend(decision.memories_to_remove.iter().cloned());

                writes.removals = decision.memories_to_remove.clone();
                writes.source_ids.extend(decision.memories_to_remove.iter().cloned());
                writes.inserts.push(MemoryRecord {
                    id: id.clone(),
                    text,
                    embedding,
                    consolidated_from,
                    ..memory.clone()
                });
                writes.result_id = Some(id);
            }
            ConsolidationAction::Replace => {
                let Some(target) = decision.target_id.clone() else {
                    // Guarded upstream; a REPLACE always carries its target here.
                    return Ok(writes);
                };
                let text = decision
                    .new_memory_content
                    .clone()
                    .unwrap_or_else(|| memory.text.clone());
                let embedding = self.embed_content(&text, memory).await;

                writes.removals = vec![target.clone()];
                writes.source_ids.push(target.clone());
                writes.inserts.push(MemoryRecord {
                    text,
                    embedding,
                    consolidated_from: vec![target],
                    ..memory.clone()
                });
                writes.result_id = Some(memory.id.clone());
            }
            ConsolidationAction::Update => {
                for edit in &decision.memories_to_update {
                    let mut consolidated_from = self
                        .store
                        .get_chunk(&edit.id)
                        .await?
                        .map(|c| c.consolidated_from)
                        .unwrap_or_default();
                    consolidated_from.push(memory.id.clone());
                    let embedding = self.embed_content(&edit.new_content, memory).await;
                    writes.updates.push(MemoryUpdate {
                        id: edit.id.clone(),
                        text: edit.new_content.clone(),
                        embedding,
                        consolidated_from,
                    });
                    writes.source_ids.push(edit.id.clone());
                }
                writes.result_id = decision.memories_to_update.first().map(|e| e.id.clone());
                if decision.store_new {
                    writes.inserts.push(memory.clone());
                }
            }
        }
        Ok(writes)
    }

    /// Embedding for rewritten content; the new memory's own vector when
    /// the text is unchanged or the embedder fails.
    async fn embed_content(&self, text: &str, memory: &MemoryRecord) -> Vec<f32> {
        if text == memory.text {
            return memory.embedding.clone();
        }
        match embed_one(self.embedder.as_ref(), text).await {
            Ok(v) if v.len() == memory.embedding.len() => v,
            Ok(v) => {
                warn!(
                    expected = memory.embedding.len(),
                    actual = v.len(),
                    "re-embedding returned wrong dimensions; reusing new memory vector"
                );
                memory.embedding.clone()
            }
            Err(e) => {
                warn!(error = %e, "re-embedding consolidated content failed; reusing new memory vector");
                memory.embedding.clone()
            }
        }
    }
}

#[derive(Default)]
struct Writes {
    removals: Vec<String>,
    updates: Vec<MemoryUpdate>,
    inserts: Vec<MemoryRecord>,
    result_id: Option<String>,
    source_ids: Vec<String>,
}

fn check_abort(signal: &CancellationToken) -> Result<()> {
    if signal.is_cancelled() {
        return Err(HarnessError::aborted("consolidation").into());
    }
    Ok(())
}

/// Hold the model to the candidates it was shown. Ids outside the set are
/// dropped; REPLACE and UPDATE with no usable target, and REPLACE below
/// `replace_threshold`, become KEEP_SEPARATE.
fn guard_decision(
    mut decision: ParsedConsolidationResponse,
    candidates: &[SimilarChunk],
    replace_threshold: f64,
) -> ParsedConsolidationResponse {
    let score_of = |id: &str| candidates.iter().find(|c| c.id == id).map(|c| c.score);
    let known = |id: &str| score_of(id).is_some();

    decision.memories_to_remove.retain(|id| known(id));
    decision.memories_to_update.retain(|e| known(&e.id));

    let downgrade = match decision.action {
        ConsolidationAction::Replace => {
            let target = decision
                .target_id
                .clone()
                .or_else(|| decision.memories_to_remove.first().cloned());
            match target {
                None => Some("REPLACE without target_id".to_string()),
                Some(t) => match score_of(&t) {
                    None => Some(format!("REPLACE target {} is not a candidate", t)),
                    Some(score) if score < replace_threshold => Some(format!(
                        "REPLACE target {} similarity {:.3} below {:.2}",
                        t, score, replace_threshold
                    )),
                    Some(_) => {
                        decision.target_id = Some(t);
                        None
                    }
                },
            }
        }
        ConsolidationAction::Update => {
            if decision.memories_to_update.is_empty() {
                if let (Some(target), Some(content)) =
                    (decision.target_id.clone(), decision.new_memory_content.clone())
                {
                    if score_of(&target).is_some() {
                        decision.memories_to_update.push(MemoryEdit {
                            id: target,
                            new_content: content,
                        });
                    }
                }
            }
            if decision.memories_to_update.is_empty() {
                Some("UPDATE without a candidate to edit".to_string())
            } else {
                None
            }
        }
        _ => None,
    };

    if let Some(reason) = downgrade {
        warn!(reason = %reason, "consolidation decision downgraded to KEEP_SEPARATE");
        decision.reasoning = if decision.reasoning.is_empty() {
            format!("guard: {}", reason)
        } else {
            format!("{} (guard: {})", decision.reasoning, reason)
        };
        decision.action = ConsolidationAction::KeepSeparate;
    }
    decision
}
