//! Prompts for consolidation decisions.

use chrono::{DateTime, Utc};

use crate::models::{MemoryRecord, SimilarChunk};

/// Fixed instructions: the five actions, when to pick each, and the
/// response shape the parser understands.
pub const SYSTEM_PROMPT: &str = r#"You maintain a long-term memory store for an AI agent.
A new memory is about to be saved. You are shown the new memory and the most similar existing memories from the same area. Decide how the new memory relates to them.

Choose exactly one action:
- MERGE: the new memory and one or more existing memories describe the same fact or topic and read better as one entry. Write the combined text in "new_memory_content" and list the existing memories it absorbs in "memories_to_remove".
- REPLACE: the new memory supersedes one existing memory that is now outdated or wrong. Put that memory's id in "target_id". Only choose REPLACE for a near-identical subject.
- KEEP_SEPARATE: the new memory is related but distinct. Both are kept.
- UPDATE: an existing memory is still right but incomplete; the new memory adds detail to it. List edits in "memories_to_update" as {"id": ..., "new_content": ...}. Set "store_new" to true if the new memory should also be kept on its own.
- SKIP: the new memory adds nothing the existing memories do not already say.

Only reference ids from the list you were given. Prefer KEEP_SEPARATE when unsure.

Respond with a single JSON object and nothing else:
{
  "action": "MERGE" | "REPLACE" | "KEEP_SEPARATE" | "UPDATE" | "SKIP",
  "target_id": "id or null",
  "memories_to_remove": ["id", ...],
  "memories_to_update": [{"id": "id", "new_content": "text"}],
  "new_memory_content": "text or null",
  "store_new": false,
  "reasoning": "one or two sentences"
}"#;

/// Message describing the new memory and its numbered candidates.
pub fn build_user_prompt(
    memory: &MemoryRecord,
    candidates: &[SimilarChunk],
    now: DateTime<Utc>,
) -> String {
    let mut prompt = format!(
        "Area: {}\nTimestamp: {}\n\nNew memory:\n{}\n\nSimilar existing memories:\n",
        memory.area.as_str(),
        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        memory.text.trim()
    );
    for (i, candidate) in candidates.iter().enumerate() {
        prompt.push_str(&format!(
            "\n{}. [id: {}] (score: {:.3}, area: {})\n{}\n",
            i + 1,
            candidate.id,
            candidate.score,
            candidate.area.as_str(),
            candidate.text.trim()
        ));
    }
    prompt
}
