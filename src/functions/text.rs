use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::{Map, Value, json};

use crate::function::{
    ExecutionContext, FunctionDefinition, FunctionHandler, FunctionKind, ParamSpec, ParamType,
    handler_fn,
};

pub fn definition() -> (FunctionDefinition, Arc<dyn FunctionHandler>) {
    let def = FunctionDefinition::new(
        "text_transform",
        "Transform or measure a piece of text",
        FunctionKind::Helper,
    )
    .param(ParamSpec::required("text", ParamType::String, "input text"))
    .param(
        ParamSpec::optional(
            "operation",
            ParamType::String,
            "uppercase, lowercase, reverse, word_count or length",
        )
        .with_default(json!("uppercase")),
    )
    .with_timeout_ms(5_000)
    .with_retries(1);

    (def, handler_fn(transform))
}

async fn transform(params: Map<String, Value>, _ctx: ExecutionContext) -> anyhow::Result<Value> {
    let text = params
        .get("text")
        .and_then(Value::as_str)
        .context("`text` must be a string")?;
    let operation = params
        .get("operation")
        .and_then(Value::as_str)
        .unwrap_or("uppercase");

    let result = match operation {
        "uppercase" => json!(text.to_uppercase()),
        "lowercase" => json!(text.to_lowercase()),
        "reverse" => json!(text.chars().rev().collect::<String>()),
        "word_count" => json!(text.split_whitespace().count()),
        "length" => json!(text.chars().count()),
        other => bail!("unsupported operation `{other}`"),
    };
    Ok(json!({ "operation": operation, "result": result }))
}
