use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::jobs::ExecutionType;

pub const CLARIFICATION: &str = "I'm not sure how to help with that. Could you rephrase your request?";

static FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("fence pattern compiles"));
static OUTERMOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("object pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ExecuteFunction,
    CancelJob,
    GetStatus,
    DirectResponse,
}

/// The action the model chose for a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Decision {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub execution_type: ExecutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<DateTime<Utc>>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_message: Option<String>,
}

impl Decision {
    pub fn direct(message: impl Into<String>) -> Self {
        Self {
            action: Action::DirectResponse,
            function_name: None,
            parameters: Map::new(),
            execution_type: ExecutionType::Instant,
            schedule_time: None,
            repeat_interval: None,
            repeat_deadline: None,
            job_id: None,
            response_message: Some(message.into()),
        }
    }

    pub fn fallback() -> Self {
        Self::direct(CLARIFICATION)
    }

    /// Reads a decision out of an arbitrary JSON object, tolerating the
    /// usual model slips (numbers as strings, parameters as a JSON string,
    /// unknown execution types). `None` unless `action` names a known action.
    pub fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .and_then(|a| serde_json::from_value::<Action>(Value::String(a.trim().to_lowercase())).ok())?;

        let parameters = match obj.get("parameters") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        };

        let execution_type = obj
            .get("execution_type")
            .and_then(Value::as_str)
            .and_then(|t| serde_json::from_value(Value::String(t.trim().to_lowercase())).ok())
            .unwrap_or_default();

        Some(Self {
            action,
            function_name: text(obj, "function_name"),
            parameters,
            execution_type,
            schedule_time: timestamp(obj, "schedule_time"),
            repeat_interval: obj.get("repeat_interval").and_then(millis),
            repeat_deadline: timestamp(obj, "repeat_deadline"),
            job_id: text(obj, "job_id"),
            response_message: text(obj, "response_message"),
        })
    }
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp(obj: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let raw = obj.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

fn millis(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Every balanced `{...}` span in `raw`, outermost first, skipping braces
/// inside string literals.
fn balanced_objects(raw: &str) -> Vec<&str> {
    let bytes = raw.as_bytes();
    let mut found = Vec::new();
    for (start, _) in raw.match_indices('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        found.push(&raw[start..=start + offset]);
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    found
}

/// Turns raw model output into a [`Decision`]. Never fails: anything that
/// does not yield an object with a known `action` becomes a clarification
/// request.
pub fn parse_decision(raw: &str) -> Decision {
    let trimmed = raw.trim();
    let mut candidates: Vec<&str> = vec![trimmed];
    candidates.extend(FENCED.captures_iter(trimmed).filter_map(|c| c.get(1)).map(|m| m.as_str().trim()));
    candidates.extend(OUTERMOST.find(trimmed).map(|m| m.as_str()));
    candidates.extend(balanced_objects(trimmed));

    for candidate in candidates {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(candidate) {
            if let Some(decision) = Decision::from_object(&obj) {
                debug!(action = ?decision.action, "parsed decision");
                return decision;
            }
        }
    }

    warn!(raw_len = raw.len(), "model reply had no usable decision; falling back to clarification");
    Decision::fallback()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_reply() {
        let d = parse_decision(
            r#"{"action":"execute_function","function_name":"math_aggregate","parameters":{"operation":"average","numbers":[10,20]}}"#,
        );
        assert_eq!(d.action, Action::ExecuteFunction);
        assert_eq!(d.function_name.as_deref(), Some("math_aggregate"));
        assert_eq!(d.parameters["operation"], json!("average"));
        assert_eq!(d.execution_type, ExecutionType::Instant);
    }

    #[test]
    fn json_inside_prose_and_fences() {
        let fenced = "Sure! Here is my decision:\n```json\n{\"action\": \"get_status\"}\n```\nLet me know.";
        assert_eq!(parse_decision(fenced).action, Action::GetStatus);

        let prose = "I think {\"action\": \"cancel_job\", \"job_id\": \"abc\"} is right.";
        let d = parse_decision(prose);
        assert_eq!(d.action, Action::CancelJob);
        assert_eq!(d.job_id.as_deref(), Some("abc"));
    }

    #[test]
    fn picks_the_object_with_an_action_among_several() {
        let raw = r#"Context: {"note": "ignore me"} Answer: {"action": "direct_response", "response_message": "hi {there}"}"#;
        let d = parse_decision(raw);
        assert_eq!(d.action, Action::DirectResponse);
        assert_eq!(d.response_message.as_deref(), Some("hi {there}"));
    }

    #[test]
    fn missing_or_unknown_action_falls_back() {
        for raw in [
            r#"{"function_name": "math_aggregate"}"#,
            r#"{"action": "launch_rockets"}"#,
            "no json here at all",
            "{ broken json",
            "",
        ] {
            let d = parse_decision(raw);
            assert_eq!(d.action, Action::DirectResponse, "{raw}");
            assert_eq!(d.response_message.as_deref(), Some(CLARIFICATION));
        }
    }

    #[test]
    fn lenient_field_types() {
        let d = parse_decision(
            r#"{"action":"EXECUTE_FUNCTION","function_name":"system_heartbeat","parameters":"{\"label\":\"x\"}",
                "execution_type":"repeat","repeat_interval":"60000","repeat_deadline":"2030-01-01T00:00:00Z",
                "schedule_time":"not a date"}"#,
        );
        assert_eq!(d.action, Action::ExecuteFunction);
        assert_eq!(d.parameters["label"], json!("x"));
        assert_eq!(d.execution_type, ExecutionType::Repeat);
        assert_eq!(d.repeat_interval, Some(60_000));
        assert!(d.repeat_deadline.is_some());
        assert!(d.schedule_time.is_none());
    }

    #[test]
    fn unknown_execution_type_defaults_to_instant() {
        let d = parse_decision(r#"{"action":"execute_function","function_name":"f","execution_type":"asap"}"#);
        assert_eq!(d.execution_type, ExecutionType::Instant);
    }
}
