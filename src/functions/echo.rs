use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::info;

use crate::function::{
    ExecutionContext, FunctionDefinition, FunctionHandler, FunctionKind, ParamSpec, ParamType,
    handler_fn,
};

const STEPS: u64 = 4;

pub fn definition() -> (FunctionDefinition, Arc<dyn FunctionHandler>) {
    let def = FunctionDefinition::new(
        "delayed_echo",
        "Wait for a while, then echo a message back",
        FunctionKind::Worker,
    )
    .param(ParamSpec::required("message", ParamType::String, "text to echo"))
    .param(
        ParamSpec::optional("delay_ms", ParamType::Integer, "how long to wait first")
            .with_default(json!(1000)),
    )
    .with_timeout_ms(60_000);

    (def, handler_fn(delayed_echo))
}

async fn delayed_echo(params: Map<String, Value>, ctx: ExecutionContext) -> anyhow::Result<Value> {
    let message = params.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
    let delay = params.get("delay_ms").and_then(Value::as_u64).unwrap_or(1000);

    let step = Duration::from_millis(delay / STEPS);
    for i in 1..=STEPS {
        tokio::time::sleep(step).await;
        ctx.report_progress((i * 100 / STEPS) as u8);
    }
    info!(parent: ctx.span(), delay_ms = delay, "echoing");
    Ok(json!({ "message": message, "delayed_ms": delay }))
}
