use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use switchyard_protocol::HealthStatus;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    DefaultProviderFactory, InstanceConfig, LlmError, LlmProvider, LlmResponse, ProviderFactory,
    ProviderKind,
};

pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct LlmInstance {
    kind: ProviderKind,
    config: InstanceConfig,
    provider: Arc<dyn LlmProvider>,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

/// What inspection tooling may see about an instance. Never carries the key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmInstanceInfo {
    pub id: String,
    pub provider: ProviderKind,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

pub struct LlmGateway {
    instances: DashMap<String, LlmInstance>,
    factory: Arc<dyn ProviderFactory>,
    idle_ttl: chrono::Duration,
}

impl LlmGateway {
    pub fn new(idle_ttl: Duration) -> Arc<Self> {
        Self::with_factory(Arc::new(DefaultProviderFactory), idle_ttl)
    }

    pub fn with_factory(factory: Arc<dyn ProviderFactory>, idle_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            instances: DashMap::new(),
            factory,
            idle_ttl: chrono::Duration::from_std(idle_ttl).unwrap_or(chrono::Duration::days(36_500)),
        })
    }

    #[tracing::instrument(name = "llm_create_instance", skip(self, config), fields(provider = %config.provider))]
    pub fn create_instance(&self, config: InstanceConfig) -> Result<String, LlmError> {
        let kind: ProviderKind = config.provider.parse()?;
        let provider = self.factory.create(kind, &config)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        info!(instance = %id, model = provider.model(), "created LLM instance");
        self.instances.insert(
            id.clone(),
            LlmInstance {
                kind,
                config,
                provider,
                created_at: now,
                last_used: now,
            },
        );
        Ok(id)
    }

    pub fn delete_instance(&self, id: &str) -> bool {
        self.instances.remove(id).is_some()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance_info(&self, id: &str) -> Option<LlmInstanceInfo> {
        self.instances.get(id).map(|entry| LlmInstanceInfo {
            id: id.to_string(),
            provider: entry.kind,
            model: entry.provider.model().to_string(),
            temperature: entry.config.temperature,
            max_tokens: entry.config.max_tokens,
            created_at: entry.created_at,
            last_used: entry.last_used,
        })
    }

    /// Single attempt; retry policy belongs to the caller. Touches the
    /// instance's last-used time only on success.
    #[tracing::instrument(name = "llm_generate", skip(self, prompt, context))]
    pub async fn generate_response(
        &self,
        instance_id: &str,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<LlmResponse, LlmError> {
        let provider = self
            .instances
            .get(instance_id)
            .map(|entry| entry.provider.clone())
            .ok_or_else(|| LlmError::InstanceNotFound(instance_id.to_string()))?;

        let response = provider.generate(prompt, context).await?;

        if let Some(mut entry) = self.instances.get_mut(instance_id) {
            entry.last_used = Utc::now();
        }
        debug!(total_tokens = response.usage.total_tokens, "LLM call completed");
        Ok(response)
    }

    /// Evicts instances idle longer than the configured TTL.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.instances.len();
        self.instances
            .retain(|_, instance| now.signed_duration_since(instance.last_used) <= self.idle_ttl);
        let evicted = before.saturating_sub(self.instances.len());
        if evicted > 0 {
            info!(evicted, "evicted idle LLM instances");
        }
        evicted
    }

    #[cfg(test)]
    fn backdate(&self, id: &str, by: chrono::Duration) {
        if let Some(mut entry) = self.instances.get_mut(id) {
            entry.last_used -= by;
        }
    }

    pub fn health(&self) -> HealthStatus {
        let count = self.instances.len();
        if count == 0 {
            HealthStatus::unhealthy("llm_gateway", "no LLM instances configured")
        } else {
            HealthStatus::healthy("llm_gateway", format!("{count} instances"))
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::llm::Usage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies from a fixed script, then repeats the last entry.
    pub struct ScriptedProvider {
        replies: Mutex<Vec<Result<String, LlmError>>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, _prompt: &str, _context: Option<&str>) -> Result<LlmResponse, LlmError> {
            let mut replies = self.replies.lock().unwrap();
            let next = if replies.len() > 1 { replies.remove(0) } else { replies[0].clone() };
            next.map(|content| LlmResponse {
                content,
                usage: Usage::default(),
            })
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    pub struct ScriptedFactory(pub Vec<Result<String, LlmError>>);

    impl ProviderFactory for ScriptedFactory {
        fn create(&self, _kind: ProviderKind, _config: &InstanceConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
            Ok(Arc::new(ScriptedProvider {
                replies: Mutex::new(self.0.clone()),
            }))
        }
    }

    fn gateway(replies: Vec<Result<String, LlmError>>) -> Arc<LlmGateway> {
        LlmGateway::with_factory(Arc::new(ScriptedFactory(replies)), DEFAULT_IDLE_TTL)
    }

    #[test]
    fn unsupported_provider_is_rejected() {
        let gw = gateway(vec![Ok("x".into())]);
        let err = gw
            .create_instance(InstanceConfig {
                provider: "palm".into(),
                ..InstanceConfig::default()
            })
            .unwrap_err();
        assert_eq!(err, LlmError::UnsupportedProvider("palm".into()));
        assert_eq!(gw.instance_count(), 0);
    }

    #[tokio::test]
    async fn generate_updates_last_used_only_on_success() {
        let gw = gateway(vec![
            Ok("first".into()),
            Err(LlmError::ProviderError("rate limited".into())),
        ]);
        let id = gw.create_instance(InstanceConfig::default()).unwrap();
        let created = gw.instance_info(&id).unwrap().last_used;

        let resp = gw.generate_response(&id, "hi", None).await.unwrap();
        assert_eq!(resp.content, "first");
        let after_ok = gw.instance_info(&id).unwrap().last_used;
        assert!(after_ok >= created);

        gw.backdate(&id, chrono::Duration::hours(1));
        let stale = gw.instance_info(&id).unwrap().last_used;
        let err = gw.generate_response(&id, "hi", None).await.unwrap_err();
        assert!(matches!(err, LlmError::ProviderError(_)));
        assert_eq!(gw.instance_info(&id).unwrap().last_used, stale);
    }

    #[tokio::test]
    async fn unknown_instance() {
        let gw = gateway(vec![Ok("x".into())]);
        let err = gw.generate_response("missing", "hi", None).await.unwrap_err();
        assert_eq!(err, LlmError::InstanceNotFound("missing".into()));
    }

    #[test]
    fn cleanup_evicts_only_idle_instances() {
        let gw = gateway(vec![Ok("x".into())]);
        let stale = gw.create_instance(InstanceConfig::default()).unwrap();
        let fresh = gw.create_instance(InstanceConfig::default()).unwrap();
        gw.backdate(&stale, chrono::Duration::hours(25));

        assert_eq!(gw.cleanup(), 1);
        assert!(gw.instance_info(&stale).is_none());
        assert!(gw.instance_info(&fresh).is_some());
        assert!(gw.delete_instance(&fresh));
        assert!(!gw.delete_instance(&fresh));
        assert!(gw.health().is_unhealthy());
    }
}
