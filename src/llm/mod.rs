//! LLM provider client.

mod gemini;
pub mod prompts;

pub use gemini::GeminiClient;

use async_trait::async_trait;

use crate::error::Result;

/// Prompt-in, text-out completion client.
///
/// Failures surface as `Error::Llm` and are treated as soft by the review
/// loop: the loop records what it has and exits early instead of crashing
/// the run.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Completes a single prompt.
    async fn complete(&self, prompt: &str) -> Result<String>;
}
