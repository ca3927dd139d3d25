//! LLM reply generation (pipeline stage B)
//!
//! Consumes wake commands, enriches them with per-session conversation
//! context, generates a reply through the Ollama gateway, and emits
//! reply records with a fresh message id.

mod history;
mod ollama;
mod prompt;
mod service;

pub use history::{ConversationHistory, ConversationTurn};
pub use ollama::{GenerateOptions, LlmError, OllamaClient};
pub use prompt::build_prompt;
pub use service::ResponderService;

use async_trait::async_trait;

/// External LLM provider contract.
///
/// [`OllamaClient`] is the production implementation; tests substitute
/// scripted gateways to exercise the retry and dead-letter paths.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Generate a completion for the prompt.
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> std::result::Result<String, LlmError>;

    /// Whether the provider currently answers.
    async fn health(&self) -> bool;

    /// Models the provider has available.
    async fn list_models(&self) -> crate::Result<Vec<String>>;
}
