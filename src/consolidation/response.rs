//! Total parser for consolidation decisions.
//!
//! Models wrap JSON in code fences, prepend chatter, or trail off after the
//! closing brace. [`parse_consolidation_response`] digs the first JSON
//! object out of whatever came back and never fails: anything it cannot
//! read becomes [`ConsolidationAction::KeepSeparate`] with `fallback` set.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsolidationAction {
    Merge,
    Replace,
    KeepSeparate,
    Update,
    Skip,
}

impl ConsolidationAction {
    pub const ALL: [ConsolidationAction; 5] = [
        ConsolidationAction::Merge,
        ConsolidationAction::Replace,
        ConsolidationAction::KeepSeparate,
        ConsolidationAction::Update,
        ConsolidationAction::Skip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationAction::Merge => "MERGE",
            ConsolidationAction::Replace => "REPLACE",
            ConsolidationAction::KeepSeparate => "KEEP_SEPARATE",
            ConsolidationAction::Update => "UPDATE",
            ConsolidationAction::Skip => "SKIP",
        }
    }
}

impl fmt::Display for ConsolidationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsolidationAction {
    type Err = String;

    /// Case-insensitive; spaces and dashes count as underscores.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        ConsolidationAction::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| format!("unknown consolidation action: {}", s))
    }
}

/// Replacement text for one existing memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEdit {
    pub id: String,
    pub new_content: String,
}

/// A consolidation decision as the model stated it. Companion fields are
/// not validated against the candidate set here.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedConsolidationResponse {
    pub action: ConsolidationAction,
    pub target_id: Option<String>,
    pub memories_to_remove: Vec<String>,
    pub memories_to_update: Vec<MemoryEdit>,
    pub new_memory_content: Option<String>,
    /// UPDATE only: also store the new memory next to the edited one.
    pub store_new: bool,
    pub reasoning: String,
    /// True when the response could not be read and the action is the default.
    pub fallback: bool,
}

impl ParsedConsolidationResponse {
    /// Default decision with a synthetic reasoning.
    pub fn keep_separate(reasoning: impl Into<String>) -> Self {
        Self {
            action: ConsolidationAction::KeepSeparate,
            target_id: None,
            memories_to_remove: Vec::new(),
            memories_to_update: Vec::new(),
            new_memory_content: None,
            store_new: false,
            reasoning: reasoning.into(),
            fallback: true,
        }
    }
}

pub fn parse_consolidation_response(raw: &str) -> ParsedConsolidationResponse {
    let Some(json) = extract_json(raw) else {
        return ParsedConsolidationResponse::keep_separate(
            "fallback: response contained no JSON object",
        );
    };

    let action = match json.get("action").and_then(Value::as_str) {
        Some(name) => match name.parse::<ConsolidationAction>() {
            Ok(action) => action,
            Err(_) => {
                return ParsedConsolidationResponse::keep_separate(format!(
                    "fallback: unrecognized action {:?}",
                    name
                ))
            }
        },
        None => {
            return ParsedConsolidationResponse::keep_separate(
                "fallback: response had no action",
            )
        }
    };

    ParsedConsolidationResponse {
        action,
        target_id: non_empty_str(&json, "target_id"),
        memories_to_remove: string_list(&json, "memories_to_remove"),
        memories_to_update: edits(&json),
        new_memory_content: non_empty_str(&json, "new_memory_content"),
        store_new: json.get("store_new").and_then(Value::as_bool).unwrap_or(false),
        reasoning: json
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        fallback: false,
    }
}

fn non_empty_str(json: &Value, key: &str) -> Option<String> {
    json.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(json: &Value, key: &str) -> Vec<String> {
    match json.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn edits(json: &Value) -> Vec<MemoryEdit> {
    let Some(Value::Array(items)) = json.get("memories_to_update") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let id = non_empty_str(item, "id")?;
            let new_content = non_empty_str(item, "new_content")?;
            Some(MemoryEdit { id, new_content })
        })
        .collect()
}

/// First JSON object in `text`: a ```json fence, any fence, then the
/// first balanced `{...}`.
fn extract_json(text: &str) -> Option<Value> {
    if let Some(start) = text.find("```json") {
        let start = start + "```json".len();
        if let Some(end) = text[start..].find("```") {
            if let Some(value) = parse_object(&text[start..start + end]) {
                return Some(value);
            }
        }
    }

    if let Some(start) = text.find("```") {
        let start = start + 3;
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            if let Some(value) = parse_object(&text[start..start + end]) {
                return Some(value);
            }
        }
    }

    let start = text.find('{')?;
    let end = balanced_end(&text[start..])?;
    parse_object(&text[start..start + end])
}

fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Byte length of the balanced object starting at `text[0] == '{'`.
/// Braces inside string literals do not count.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
