use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::error;

use super::{InstanceConfig, LlmError, LlmResponse, LlmProvider, Usage, provider::system_text};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat Completions over plain `reqwest`.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    system_prompt: Option<String>,
}

impl OpenAiProvider {
    pub fn new(config: &InstanceConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidConfig("openai requires an API key".into()))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::InvalidConfig(format!("reqwest client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: config
                .base_url
                .as_ref()
                .map(|u| u.as_str().trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
        })
    }

    fn body(&self, prompt: &str, context: Option<&str>) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = system_text(self.system_prompt.as_deref(), context) {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    #[tracing::instrument(name = "openai_generate", skip(self, prompt, context), fields(model = %self.model))]
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&self.body(prompt, context))
            .send()
            .await
            .map_err(|e| LlmError::ProviderError(format!("OpenAI request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("OpenAI error: {}", text);
            return Err(LlmError::ProviderError(format!(
                "OpenAI API returned {status}: {text}"
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::ProviderError(format!("Invalid OpenAI response: {e}")))?;
        parse_completion(&json)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn parse_completion(json: &Value) -> Result<LlmResponse, LlmError> {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| LlmError::ProviderError("OpenAI response has no message content".into()))?
        .to_string();
    let usage = &json["usage"];
    Ok(LlmResponse {
        content,
        usage: Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
        },
    })
}
