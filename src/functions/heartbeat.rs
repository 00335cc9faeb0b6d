use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::function::{
    ExecutionContext, FunctionDefinition, FunctionHandler, FunctionKind, ParamSpec, ParamType,
    handler_fn,
};

pub fn definition() -> (FunctionDefinition, Arc<dyn FunctionHandler>) {
    let def = FunctionDefinition::new(
        "system_heartbeat",
        "Emit a timestamped heartbeat; meant to be scheduled on an interval",
        FunctionKind::Runner,
    )
    .param(
        ParamSpec::optional("label", ParamType::String, "tag included in the heartbeat")
            .with_default(json!("heartbeat")),
    )
    .with_timeout_ms(5_000)
    .with_retries(1);

    (def, handler_fn(heartbeat))
}

async fn heartbeat(params: Map<String, Value>, ctx: ExecutionContext) -> anyhow::Result<Value> {
    let label = params.get("label").and_then(Value::as_str).unwrap_or("heartbeat");
    let now = Utc::now();
    info!(target: "job", parent: ctx.span(), label, "heartbeat");
    Ok(json!({ "label": label, "at": now.to_rfc3339(), "job_id": ctx.job_id }))
}
