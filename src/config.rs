use async_trait::async_trait;
use std::{collections::HashMap, env, fmt, path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
    bus::BusConfig, jobs::EngineConfig, llm::InstanceConfig, orchestrator::OrchestratorConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Where raw setting values come from.
#[async_trait]
pub trait ConfigSource: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Option<String>;
}

#[derive(Debug)]
pub struct ConfigManager(pub Box<dyn ConfigSource>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

/// Reads the process environment after loading an optional `.env` file.
/// Variables already set in the environment win over the file.
#[derive(Clone, Debug)]
pub struct EnvConfigSource;

impl EnvConfigSource {
    pub fn new(env_file: &Path) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {e}", env_file.display()),
            }
        } else {
            info!("no .env at {}; using the process environment", env_file.display());
        }

        Box::new(Self)
    }
}

#[async_trait]
impl ConfigSource for EnvConfigSource {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// Fixed values, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    map: HashMap<String, String>,
}

impl MapConfigSource {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(Self { map })
    }
}

#[async_trait]
impl ConfigSource for MapConfigSource {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }
}

/// Typed runtime settings resolved from a [`ConfigManager`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub bus: BusConfig,
    pub engine: EngineConfig,
    pub llm: InstanceConfig,
    pub orchestrator: OrchestratorConfig,
    pub llm_idle_ttl: Duration,
    pub llm_cleanup_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            engine: EngineConfig::default(),
            llm: InstanceConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            llm_idle_ttl: Duration::from_secs(24 * 60 * 60),
            llm_cleanup_interval: Duration::from_secs(60 * 60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Settings {
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let d = Settings::default();

        let bus = BusConfig {
            nats_url: string_or(config, "SWITCHYARD_NATS_URL", d.bus.nats_url).await,
            stream: string_or(config, "SWITCHYARD_STREAM", d.bus.stream).await,
            inbound_subject: string_or(config, "SWITCHYARD_INBOUND_SUBJECT", d.bus.inbound_subject)
                .await,
            outbound_subject: string_or(
                config,
                "SWITCHYARD_OUTBOUND_SUBJECT",
                d.bus.outbound_subject,
            )
            .await,
            consumer: string_or(config, "SWITCHYARD_CONSUMER", d.bus.consumer).await,
            max_deliver: parse_or(config, "SWITCHYARD_MAX_DELIVER", d.bus.max_deliver).await?,
            reconnect_delay: millis_or(config, "SWITCHYARD_RECONNECT_DELAY_MS", d.bus.reconnect_delay)
                .await?,
            publish_timeout: millis_or(config, "SWITCHYARD_PUBLISH_TIMEOUT_MS", d.bus.publish_timeout)
                .await?,
        };

        let engine = EngineConfig {
            max_concurrent_jobs: parse_or(
                config,
                "SWITCHYARD_MAX_CONCURRENT_JOBS",
                d.engine.max_concurrent_jobs,
            )
            .await?,
            retention: parse_or(config, "SWITCHYARD_JOB_RETENTION", d.engine.retention).await?,
            backoff_base: millis_or(config, "SWITCHYARD_JOB_BACKOFF_MS", d.engine.backoff_base)
                .await?,
        };
        if engine.max_concurrent_jobs == 0 {
            return Err(invalid("SWITCHYARD_MAX_CONCURRENT_JOBS", "0", "must be at least 1"));
        }

        let base_url = match config.get("LLM_BASE_URL").await {
            Some(raw) => Some(
                Url::parse(&raw).map_err(|e| invalid("LLM_BASE_URL", &raw, &e.to_string()))?,
            ),
            None => None,
        };
        let llm = InstanceConfig {
            provider: string_or(config, "LLM_PROVIDER", d.llm.provider).await,
            api_key: config.get("LLM_API_KEY").await,
            model: config.get("LLM_MODEL").await,
            temperature: parse_or(config, "LLM_TEMPERATURE", d.llm.temperature).await?,
            max_tokens: parse_or(config, "LLM_MAX_TOKENS", d.llm.max_tokens).await?,
            system_prompt: config.get("LLM_SYSTEM_PROMPT").await,
            base_url,
        };

        let orchestrator = OrchestratorConfig {
            instant_timeout: millis_or(
                config,
                "SWITCHYARD_INSTANT_TIMEOUT_MS",
                d.orchestrator.instant_timeout,
            )
            .await?,
            poll_interval: millis_or(config, "SWITCHYARD_POLL_INTERVAL_MS", d.orchestrator.poll_interval)
                .await?,
        };

        Ok(Settings {
            bus,
            engine,
            llm,
            orchestrator,
            llm_idle_ttl: secs_or(config, "LLM_IDLE_TTL_SECS", d.llm_idle_ttl).await?,
            llm_cleanup_interval: secs_or(config, "LLM_CLEANUP_INTERVAL_SECS", d.llm_cleanup_interval)
                .await?,
            shutdown_timeout: millis_or(config, "SWITCHYARD_SHUTDOWN_TIMEOUT_MS", d.shutdown_timeout)
                .await?,
        })
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

async fn string_or(config: &ConfigManager, key: &str, default: String) -> String {
    match config.get(key).await {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default,
    }
}

async fn parse_or<T>(config: &ConfigManager, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match config.get(key).await {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
        _ => Ok(default),
    }
}

async fn millis_or(config: &ConfigManager, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let ms = parse_or(config, key, default.as_millis() as u64).await?;
    Ok(Duration::from_millis(ms))
}

async fn secs_or(config: &ConfigManager, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = parse_or(config, key, default.as_secs()).await?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn env_file_fills_gaps_in_the_environment() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(
            &env_path,
            "SWITCHYARD_TEST_FILE_KEY=abc123\nSWITCHYARD_TEST_SHADOWED_KEY=from-file\n",
        )
        .unwrap();
        unsafe {
            std::env::set_var("SWITCHYARD_TEST_SHADOWED_KEY", "from-env");
        }

        let config = ConfigManager(EnvConfigSource::new(&env_path));
        assert_eq!(config.get("SWITCHYARD_TEST_FILE_KEY").await, Some("abc123".to_string()));
        assert_eq!(config.get("SWITCHYARD_TEST_SHADOWED_KEY").await, Some("from-env".to_string()));
    }

    #[tokio::test]
    async fn missing_env_file_reads_the_environment() {
        let dir = tempdir().unwrap();
        let config = ConfigManager(EnvConfigSource::new(&dir.path().join(".env")));
        assert_eq!(config.get("SWITCHYARD_TEST_NEVER_SET").await, None);
        assert_eq!(
            Settings::load(&config).await.unwrap().bus.stream,
            Settings::default().bus.stream
        );
    }

    #[tokio::test]
    async fn settings_fall_back_to_defaults() {
        let settings = Settings::load(&ConfigManager(MapConfigSource::new())).await.unwrap();
        assert_eq!(settings.engine.max_concurrent_jobs, 10);
        assert_eq!(settings.orchestrator.instant_timeout, Duration::from_secs(30));
        assert_eq!(settings.orchestrator.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.bus.publish_timeout, Duration::from_secs(5));
        assert_eq!(settings.bus.reconnect_delay, Duration::from_secs(5));
        assert_eq!(settings.llm_idle_ttl, Duration::from_secs(86_400));
        assert_eq!(settings.llm.provider, "ollama");
    }

    #[tokio::test]
    async fn settings_read_overrides() {
        let config = ConfigManager(MapConfigSource::from_pairs([
            ("SWITCHYARD_MAX_CONCURRENT_JOBS", "4"),
            ("SWITCHYARD_INBOUND_SUBJECT", "custom.in"),
            ("LLM_PROVIDER", "openai"),
            ("LLM_API_KEY", "sk-test"),
            ("LLM_BASE_URL", "http://localhost:8080/v1"),
        ]));
        let settings = Settings::load(&config).await.unwrap();
        assert_eq!(settings.engine.max_concurrent_jobs, 4);
        assert_eq!(settings.bus.inbound_subject, "custom.in");
        assert_eq!(settings.llm.provider, "openai");
        assert_eq!(settings.llm.api_key.as_deref(), Some("sk-test"));
        assert!(settings.llm.base_url.is_some());
    }

    #[tokio::test]
    async fn malformed_numbers_name_the_key() {
        let config = ConfigManager(MapConfigSource::from_pairs([(
            "SWITCHYARD_INSTANT_TIMEOUT_MS",
            "soon",
        )]));
        let err = Settings::load(&config).await.unwrap_err();
        assert!(err.to_string().contains("SWITCHYARD_INSTANT_TIMEOUT_MS"));

        let zero = ConfigManager(MapConfigSource::from_pairs([("SWITCHYARD_MAX_CONCURRENT_JOBS", "0")]));
        assert!(Settings::load(&zero).await.is_err());
    }
}
