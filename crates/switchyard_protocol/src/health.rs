use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

/// One component's health, as reported to tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HealthStatus {
    pub module: String,
    pub status: HealthState,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn new(module: impl Into<String>, status: HealthState, details: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            status,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn healthy(module: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(module, HealthState::Healthy, details)
    }

    pub fn unhealthy(module: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(module, HealthState::Unhealthy, details)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthState::Unhealthy
    }

    /// Folds component reports into a single umbrella record: unhealthy if
    /// any component is, unknown if any is unknown, otherwise healthy.
    pub fn aggregate(module: impl Into<String>, parts: &[HealthStatus]) -> Self {
        let failing: Vec<&str> = parts
            .iter()
            .filter(|p| p.is_unhealthy())
            .map(|p| p.module.as_str())
            .collect();
        if !failing.is_empty() {
            return Self::unhealthy(module, format!("unhealthy: {}", failing.join(", ")));
        }
        if parts.iter().any(|p| p.status == HealthState::Unknown) {
            return Self::new(module, HealthState::Unknown, "some components have not reported yet");
        }
        Self::healthy(module, format!("{} components healthy", parts.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn aggregate_is_unhealthy_when_any_part_is() {
        let parts = vec![
            HealthStatus::healthy("registry", "4 functions"),
            HealthStatus::unhealthy("bus", "disconnected"),
            HealthStatus::new("llm", HealthState::Unknown, "no instances"),
        ];
        let agg = HealthStatus::aggregate("orchestrator", &parts);
        assert_eq!(agg.status, HealthState::Unhealthy);
        assert!(agg.details.contains("bus"));
    }

    #[test]
    fn aggregate_healthy_and_unknown() {
        let healthy = vec![HealthStatus::healthy("a", ""), HealthStatus::healthy("b", "")];
        assert_eq!(HealthStatus::aggregate("x", &healthy).status, HealthState::Healthy);

        let mixed = vec![
            HealthStatus::healthy("a", ""),
            HealthStatus::new("b", HealthState::Unknown, ""),
        ];
        assert_eq!(HealthStatus::aggregate("x", &mixed).status, HealthState::Unknown);
    }

    #[test]
    fn state_serializes_lowercase() {
        let status = HealthStatus::healthy("registry", "ok");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(HealthState::from_str("unhealthy").unwrap(), HealthState::Unhealthy);
        assert_eq!(HealthState::Unknown.to_string(), "unknown");
    }
}
