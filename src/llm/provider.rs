use std::sync::Arc;

use async_trait::async_trait;

use super::{InstanceConfig, LlmError, LlmResponse, ProviderKind, ollama::OllamaProvider, openai::OpenAiProvider};

/// One configured text-generation backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// `context`, when present, is extra system-level context for this call.
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<LlmResponse, LlmError>;

    fn model(&self) -> &str;
}

/// Builds providers for the gateway; swapped out in tests.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind, config: &InstanceConfig) -> Result<Arc<dyn LlmProvider>, LlmError>;
}

#[derive(Debug, Default, Clone)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, kind: ProviderKind, config: &InstanceConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
        Ok(match kind {
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config)?),
            ProviderKind::Ollama => Arc::new(OllamaProvider::new(config)),
        })
    }
}

/// Joins the configured system prompt and per-call context.
pub(crate) fn system_text(config_prompt: Option<&str>, context: Option<&str>) -> Option<String> {
    match (config_prompt, context) {
        (Some(p), Some(c)) => Some(format!("{p}\n\n{c}")),
        (Some(p), None) => Some(p.to_string()),
        (None, Some(c)) => Some(c.to_string()),
        (None, None) => None,
    }
}
