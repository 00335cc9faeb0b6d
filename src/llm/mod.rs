//! Uniform access to text-generation providers.

pub mod gateway;
pub mod ollama;
pub mod openai;
pub mod provider;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use gateway::{LlmGateway, LlmInstanceInfo};
pub use provider::{DefaultProviderFactory, LlmProvider, ProviderFactory};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LlmError {
    #[error("unsupported provider `{0}` (expected `openai` or `ollama`)")]
    UnsupportedProvider(String),
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
    #[error("LLM instance `{0}` not found")]
    InstanceNotFound(String),
    #[error("provider call failed: {0}")]
    ProviderError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Ollama,
}

impl FromStr for ProviderKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(LlmError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
        })
    }
}

/// Settings for one provider session. `provider` stays a string until
/// [`LlmGateway::create_instance`] checks it.
#[derive(Clone, PartialEq)]
pub struct InstanceConfig {
    pub provider: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub base_url: Option<Url>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            api_key: None,
            model: None,
            temperature: 0.2,
            max_tokens: 1024,
            system_prompt: None,
            base_url: None,
        }
    }
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "********"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("system_prompt", &self.system_prompt)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Usage,
}
