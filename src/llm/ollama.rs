use async_trait::async_trait;
use ollama_rs::Ollama;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::models::ModelOptions;

use super::{InstanceConfig, LlmError, LlmProvider, LlmResponse, Usage, provider::system_text};

const DEFAULT_MODEL: &str = "llama3.1";

/// Local or remote Ollama server through `ollama-rs`.
pub struct OllamaProvider {
    client: Ollama,
    model: String,
    temperature: f32,
    max_tokens: u32,
    system_prompt: Option<String>,
}

impl OllamaProvider {
    pub fn new(config: &InstanceConfig) -> Self {
        let client = match &config.base_url {
            Some(url) => Ollama::from_url(url.clone()),
            None => Ollama::default(),
        };
        Self {
            client,
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    #[tracing::instrument(name = "ollama_generate", skip(self, prompt, context), fields(model = %self.model))]
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<LlmResponse, LlmError> {
        let options = ModelOptions::default()
            .temperature(self.temperature)
            .num_predict(self.max_tokens.min(i32::MAX as u32) as i32);
        let mut request = GenerationRequest::new(self.model.clone(), prompt).options(options);
        if let Some(system) = system_text(self.system_prompt.as_deref(), context) {
            request = request.system(system);
        }

        let resp = self
            .client
            .generate(request)
            .await
            .map_err(|e| LlmError::ProviderError(format!("Ollama request failed: {e}")))?;

        let prompt_tokens = resp.prompt_eval_count.unwrap_or(0);
        let completion_tokens = resp.eval_count.unwrap_or(0);
        Ok(LlmResponse {
            content: resp.response,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}
