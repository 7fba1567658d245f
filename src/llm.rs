//! LLM call contract.
//!
//! The consolidation engine asks an external model for a decision through
//! [`LlmClient`]. Implementations return the raw completion text; the
//! engine parses it defensively and never trusts it to be JSON.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Declared purpose of an LLM call, for provider routing and accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmTaskType {
    MemoryConsolidation,
}

impl LlmTaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmTaskType::MemoryConsolidation => "memory_consolidation",
        }
    }
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub task_type: LlmTaskType,
    /// Cancelled when the caller abandons the request.
    pub signal: CancellationToken,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identity recorded in the consolidation log.
    fn model_name(&self) -> &str;

    /// Run a completion and return the raw response text.
    async fn call(&self, request: LlmRequest) -> Result<String>;
}
