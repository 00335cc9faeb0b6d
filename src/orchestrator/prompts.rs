use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde_json::{Value, json};

use super::OrchestratorError;
use crate::function::FunctionDefinition;

const DECISION: &str = "decision";
const SUMMARY: &str = "summary";

const DECISION_TEMPLATE: &str = r#"You route user requests for a task orchestrator.
The current time is {{now}}.

Functions you can call:
{{functions}}

Reply with exactly one JSON object and nothing else:
{"action": "execute_function" | "cancel_job" | "get_status" | "direct_response",
 "function_name": string, "parameters": object,
 "execution_type": "instant" | "schedule" | "repeat",
 "schedule_time": ISO-8601 string, "repeat_interval": milliseconds, "repeat_deadline": ISO-8601 string,
 "job_id": string, "response_message": string}

Rules:
- execute_function: only functions listed above, with their declared parameters.
- execution_type "schedule" needs a future schedule_time; "repeat" needs repeat_interval and is allowed only for functions of type "runner".
- cancel_job: set job_id.
- get_status: questions about the system, its jobs or its health.
- direct_response: anything else; put the full answer in response_message."#;

const SUMMARY_TEMPLATE: &str = r#"The user asked: "{{request}}"

The function `{{function}}` was run for them and returned:
{{result}}

Answer the user in one or two friendly sentences based on that result. Quote numbers exactly as returned."#;

/// Renders the decision and summary prompts.
pub struct Prompts {
    registry: Handlebars<'static>,
}

impl Prompts {
    pub fn new() -> Result<Self, OrchestratorError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(DECISION, DECISION_TEMPLATE)
            .map_err(|e| OrchestratorError::Prompt(e.to_string()))?;
        registry
            .register_template_string(SUMMARY, SUMMARY_TEMPLATE)
            .map_err(|e| OrchestratorError::Prompt(e.to_string()))?;
        Ok(Self { registry })
    }

    /// System context for the decision call; embeds the whole catalog.
    pub fn decision(&self, functions: &[FunctionDefinition], now: DateTime<Utc>) -> Result<String, OrchestratorError> {
        let catalog = serde_json::to_string_pretty(functions).map_err(|e| OrchestratorError::Prompt(e.to_string()))?;
        self.render(
            DECISION,
            &json!({
                "now": now.to_rfc3339(),
                "functions": catalog,
            }),
        )
    }

    pub fn summary(&self, request: &str, function: &str, result: &Value) -> Result<String, OrchestratorError> {
        self.render(
            SUMMARY,
            &json!({
                "request": request,
                "function": function,
                "result": render_value(result),
            }),
        )
    }

    fn render(&self, name: &str, data: &Value) -> Result<String, OrchestratorError> {
        self.registry
            .render(name, data)
            .map_err(|e| OrchestratorError::Prompt(e.to_string()))
    }
}

/// Strings as-is, everything else as compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionKind, ParamSpec, ParamType};

    #[test]
    fn decision_prompt_embeds_catalog_unescaped() {
        let prompts = Prompts::new().unwrap();
        let defs = vec![
            FunctionDefinition::new("math_aggregate", "Aggregate \"numbers\" & more", FunctionKind::Helper)
                .param(ParamSpec::required("numbers", ParamType::Array, "values")),
        ];
        let text = prompts.decision(&defs, Utc::now()).unwrap();
        assert!(text.contains("\"name\": \"math_aggregate\""));
        assert!(text.contains("& more"));
        assert!(text.contains("\"type\": \"helper\""));
    }

    #[test]
    fn summary_prompt_includes_request_and_result() {
        let prompts = Prompts::new().unwrap();
        let text = prompts
            .summary("average of 10 and 20?", "math_aggregate", &json!({"result": 15}))
            .unwrap();
        assert!(text.contains("average of 10 and 20?"));
        assert!(text.contains(r#"{"result":15}"#));
        assert!(text.contains("`math_aggregate`"));
    }
}
