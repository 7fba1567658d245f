//! TOML configuration.
//!
//! A single file configures the database, chunking, embedding identity,
//! deduplication, import, retrieval and consolidation. Every field except
//! `db.path` and `embedding.model` has a default. [`load_config`] parses and
//! validates; [`ConsolidationConfig::resolve`] collapses provider overrides
//! into an immutable [`ResolvedConsolidation`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::HarnessError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Loadable SQLite extension providing `vec0`. Empty disables probing.
    #[serde(default = "default_vector_extension")]
    pub vector_extension: String,
}

fn default_vector_extension() -> String {
    "vec0".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_true")]
    pub heading_aware: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
            heading_aware: true,
        }
    }
}

fn default_max_tokens() -> usize {
    400
}
fn default_overlap() -> usize {
    80
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Model identity recorded on every stored vector.
    pub model: String,
    /// Vector dimensionality. When set, the vector index is created at open.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub hash_dedup: bool,
    #[serde(default = "default_true")]
    pub similarity_dedup: bool,
    /// Cosine similarity at or above which a chunk is a near duplicate.
    #[serde(default = "default_dedup_threshold")]
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            hash_dedup: true,
            similarity_dedup: true,
            similarity_threshold: default_dedup_threshold(),
        }
    }
}

fn default_dedup_threshold() -> f64 {
    0.95
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_category")]
    pub category: String,
    /// Sidecar import-state file. Defaults to `<db path>.import-state.json`.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            category: default_category(),
            state_path: None,
        }
    }
}

fn default_category() -> String {
    "docs".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default)]
    pub min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            final_limit: default_final_limit(),
            min_score: 0.0,
        }
    }
}

fn default_vector_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_final_limit() -> usize {
    6
}

/// Per-provider overrides of the consolidation limits. `0` means unlimited.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationLimits {
    #[serde(default)]
    pub max_similar_memories: Option<usize>,
    #[serde(default)]
    pub max_llm_context_memories: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsolidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Similarity floor for an existing memory to be a candidate.
    #[serde(default = "default_candidate_threshold")]
    pub similarity_threshold: f64,
    /// Minimum similarity of the target for a REPLACE to be honored.
    #[serde(default = "default_replace_threshold")]
    pub replace_threshold: f64,
    #[serde(default = "default_max_similar")]
    pub max_similar_memories: usize,
    #[serde(default = "default_max_llm_context")]
    pub max_llm_context_memories: usize,
    /// Provider whose overrides apply, if any.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, ConsolidationLimits>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: default_candidate_threshold(),
            replace_threshold: default_replace_threshold(),
            max_similar_memories: default_max_similar(),
            max_llm_context_memories: default_max_llm_context(),
            provider: None,
            providers: HashMap::new(),
        }
    }
}

fn default_candidate_threshold() -> f64 {
    0.7
}
fn default_replace_threshold() -> f64 {
    0.9
}
fn default_max_similar() -> usize {
    10
}
fn default_max_llm_context() -> usize {
    5
}

/// Fully resolved consolidation settings. `None` limits are unlimited.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConsolidation {
    pub enabled: bool,
    pub similarity_threshold: f64,
    pub replace_threshold: f64,
    pub max_similar_memories: Option<usize>,
    pub max_llm_context_memories: Option<usize>,
}

impl Default for ResolvedConsolidation {
    fn default() -> Self {
        ConsolidationConfig::default().resolve(None)
    }
}

fn limit(value: usize) -> Option<usize> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

impl ConsolidationConfig {
    /// Resolve limits for `provider` (falling back to the configured
    /// `provider`, then to the defaults).
    pub fn resolve(&self, provider: Option<&str>) -> ResolvedConsolidation {
        let overrides = provider
            .or(self.provider.as_deref())
            .and_then(|name| self.providers.get(name));

        let max_similar = overrides
            .and_then(|o| o.max_similar_memories)
            .unwrap_or(self.max_similar_memories);
        let max_context = overrides
            .and_then(|o| o.max_llm_context_memories)
            .unwrap_or(self.max_llm_context_memories);

        ResolvedConsolidation {
            enabled: self.enabled,
            similarity_threshold: self.similarity_threshold,
            replace_threshold: self.replace_threshold,
            max_similar_memories: limit(max_similar),
            max_llm_context_memories: limit(max_context),
        }
    }
}

impl Config {
    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the sidecar import-state file.
    pub fn state_path(&self) -> PathBuf {
        match &self.import.state_path {
            Some(path) => path.clone(),
            None => {
                let mut name = self.db.path.as_os_str().to_owned();
                name.push(".import-state.json");
                PathBuf::from(name)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> anyhow::Error { HarnessError::InvalidConfig(msg.to_string()).into() };

        if self.chunking.max_tokens == 0 {
            return Err(invalid("chunking.max_tokens must be > 0"));
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(invalid("chunking.overlap_tokens must be < chunking.max_tokens"));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(invalid("embedding.model must be specified"));
        }
        if self.embedding.dims == Some(0) {
            return Err(invalid("embedding.dims must be > 0 when set"));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            return Err(invalid("dedup.similarity_threshold must be in [0.0, 1.0]"));
        }
        if !(0.0..=1.0).contains(&self.retrieval.vector_weight)
            || !(0.0..=1.0).contains(&self.retrieval.keyword_weight)
        {
            return Err(invalid("retrieval weights must be in [0.0, 1.0]"));
        }
        if self.retrieval.final_limit == 0 {
            return Err(invalid("retrieval.final_limit must be >= 1"));
        }
        if self.retrieval.candidate_multiplier == 0 {
            return Err(invalid("retrieval.candidate_multiplier must be >= 1"));
        }
        let c = &self.consolidation;
        if !(0.0..=1.0).contains(&c.similarity_threshold)
            || !(0.0..=1.0).contains(&c.replace_threshold)
        {
            return Err(invalid("consolidation thresholds must be in [0.0, 1.0]"));
        }
        if c.replace_threshold < c.similarity_threshold {
            return Err(invalid(
                "consolidation.replace_threshold must be >= consolidation.similarity_threshold",
            ));
        }
        if let Some(provider) = &c.provider {
            if !c.providers.contains_key(provider) {
                return Err(invalid(&format!(
                    "consolidation.provider '{}' has no [consolidation.providers.{}] table",
                    provider, provider
                )));
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/kh/knowledge.sqlite"

[embedding]
model = "nomic-embed-text"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.db.vector_extension, "vec0");
        assert_eq!(config.chunking.max_tokens, 400);
        assert_eq!(config.chunking.overlap_tokens, 80);
        assert!(config.chunking.heading_aware);
        assert_eq!(config.embedding.batch_size, 50);
        assert_eq!(config.embedding.dims, None);
        assert!(config.dedup.hash_dedup && config.dedup.similarity_dedup);
        assert_eq!(config.import.category, "docs");
        assert_eq!(config.consolidation.max_similar_memories, 10);
        assert_eq!(config.consolidation.max_llm_context_memories, 5);
        assert_eq!(
            config.state_path(),
            PathBuf::from("/tmp/kh/knowledge.sqlite.import-state.json")
        );
    }

    #[test]
    fn test_missing_model_rejected() {
        let err = Config::from_toml_str("[db]\npath = \"x.db\"\n[embedding]\nmodel = \" \"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_overlap_must_be_below_budget() {
        let toml = format!("{}\n[chunking]\nmax_tokens = 50\noverlap_tokens = 50\n", MINIMAL);
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_replace_threshold_below_floor_rejected() {
        let toml = format!(
            "{}\n[consolidation]\nsimilarity_threshold = 0.8\nreplace_threshold = 0.5\n",
            MINIMAL
        );
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_resolve_defaults_and_overrides() {
        let toml = format!(
            r#"{}
[consolidation]
max_similar_memories = 12
max_llm_context_memories = 0

[consolidation.providers.local]
max_llm_context_memories = 3

[consolidation.providers.unbounded]
max_similar_memories = 0
"#,
            MINIMAL
        );
        let config = Config::from_toml_str(&toml).unwrap();

        let default = config.consolidation.resolve(None);
        assert_eq!(default.max_similar_memories, Some(12));
        assert_eq!(default.max_llm_context_memories, None);

        let local = config.consolidation.resolve(Some("local"));
        assert_eq!(local.max_similar_memories, Some(12));
        assert_eq!(local.max_llm_context_memories, Some(3));

        let unbounded = config.consolidation.resolve(Some("unbounded"));
        assert_eq!(unbounded.max_similar_memories, None);

        let unknown = config.consolidation.resolve(Some("missing"));
        assert_eq!(unknown, default);
    }

    #[test]
    fn test_configured_provider_must_exist() {
        let toml = format!("{}\n[consolidation]\nprovider = \"ghost\"\n", MINIMAL);
        assert!(Config::from_toml_str(&toml).is_err());
    }
}
