use std::collections::HashSet;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRIES: u32 = 3;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,63}$").expect("identifier pattern compiles"));

/// What a function is allowed to do and how it may be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    /// Pure, short computations.
    Helper,
    /// Long-lived or periodic work; the only kind that may repeat.
    Runner,
    /// Heavier one-off work, possibly with side effects.
    Worker,
}

impl FunctionKind {
    pub fn can_repeat(&self) -> bool {
        matches!(self, FunctionKind::Runner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    fn schema(&self) -> Value {
        match self {
            ParamType::String => json!({"type": "string"}),
            ParamType::Number => json!({"type": "number"}),
            ParamType::Integer => json!({"type": "integer"}),
            ParamType::Boolean => json!({"type": "boolean"}),
            ParamType::Array => json!({"type": "array"}),
            ParamType::Object => json!({"type": "object"}),
            ParamType::Any => json!({}),
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Immutable descriptor of a callable function. Serializes to the
/// definition export shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: FunctionKind,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    /// Milliseconds.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl FunctionDefinition {
    pub fn new(name: &str, description: &str, kind: FunctionKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            kind,
            parameters: Vec::new(),
            timeout_ms: None,
            retries: None,
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Total attempts a job for this function gets.
    pub fn max_attempts(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES).max(1)
    }

    /// Structural checks applied before a definition is registered.
    pub fn validate(&self) -> Result<(), String> {
        if !NAME_RE.is_match(&self.name) {
            return Err(format!(
                "name `{}` must start with a letter and contain only letters, digits or `_`",
                self.name
            ));
        }
        if self.description.trim().is_empty() {
            return Err("description must not be empty".into());
        }
        if self.timeout_ms == Some(0) {
            return Err("timeout must be greater than zero".into());
        }

        let mut seen = HashSet::new();
        for p in &self.parameters {
            if !NAME_RE.is_match(&p.name) {
                return Err(format!("parameter name `{}` is not a valid identifier", p.name));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(format!("parameter `{}` is declared twice", p.name));
            }
            if let Some(default) = &p.default {
                if p.required {
                    return Err(format!("required parameter `{}` cannot have a default", p.name));
                }
                if !p.param_type.matches(default) {
                    return Err(format!(
                        "default for `{}` does not match its declared type",
                        p.name
                    ));
                }
            }
        }
        Ok(())
    }

    /// JSON Schema describing the parameter object this function accepts.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            let mut schema = p.param_type.schema();
            if let Value::Object(obj) = &mut schema {
                if !p.description.is_empty() {
                    obj.insert("description".into(), Value::String(p.description.clone()));
                }
            }
            properties.insert(p.name.clone(), schema);
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Fills declared defaults, rejects missing required parameters, then
    /// checks the completed object against [`Self::parameters_schema`].
    pub fn prepare_params(&self, params: &Value) -> Result<Map<String, Value>, String> {
        let mut prepared = match params {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => return Err(format!("parameters must be an object, got {other}")),
        };

        for p in &self.parameters {
            let present = prepared.get(&p.name).is_some_and(|v| !v.is_null());
            if present {
                continue;
            }
            if p.required {
                return Err(format!("missing required parameter `{}`", p.name));
            }
            match &p.default {
                Some(default) => {
                    prepared.insert(p.name.clone(), default.clone());
                }
                None => {
                    prepared.remove(&p.name);
                }
            }
        }

        let schema = self.parameters_schema();
        let validator = jsonschema::validator_for(&schema).map_err(|e| e.to_string())?;
        let instance = Value::Object(prepared);
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect();
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }

        match instance {
            Value::Object(map) => Ok(map),
            _ => Err("parameters must be an object".into()),
        }
    }
}
