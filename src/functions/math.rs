use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::{Map, Value, json};

use crate::function::{
    ExecutionContext, FunctionDefinition, FunctionHandler, FunctionKind, ParamSpec, ParamType,
    handler_fn,
};

pub fn definition() -> (FunctionDefinition, Arc<dyn FunctionHandler>) {
    let def = FunctionDefinition::new(
        "math_aggregate",
        "Aggregate a list of numbers: sum, average, min, max, median or count",
        FunctionKind::Helper,
    )
    .param(ParamSpec::required(
        "operation",
        ParamType::String,
        "one of sum, average, min, max, median, count",
    ))
    .param(ParamSpec::required("numbers", ParamType::Array, "the numbers to aggregate"))
    .with_timeout_ms(5_000)
    .with_retries(1);

    (def, handler_fn(aggregate))
}

async fn aggregate(params: Map<String, Value>, _ctx: ExecutionContext) -> anyhow::Result<Value> {
    let operation = params
        .get("operation")
        .and_then(Value::as_str)
        .context("`operation` must be a string")?
        .to_lowercase();
    let numbers = params
        .get("numbers")
        .and_then(Value::as_array)
        .context("`numbers` must be an array")?
        .iter()
        .map(number)
        .collect::<anyhow::Result<Vec<f64>>>()?;

    if numbers.is_empty() && operation != "count" {
        bail!("cannot compute `{operation}` of an empty list");
    }

    let result = match operation.as_str() {
        "sum" => numbers.iter().sum(),
        "average" | "avg" | "mean" => numbers.iter().sum::<f64>() / numbers.len() as f64,
        "min" => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        "max" => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        "median" => median(numbers.clone()),
        "count" => numbers.len() as f64,
        other => bail!("unsupported operation `{other}`"),
    };

    Ok(json!({
        "operation": operation,
        "result": to_json_number(result),
        "count": numbers.len(),
    }))
}

/// Accepts JSON numbers and numeric strings.
fn number(value: &Value) -> anyhow::Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().context("number out of range"),
        Value::String(s) => s
            .trim()
            .parse()
            .with_context(|| format!("`{s}` is not a number")),
        other => bail!("`{other}` is not a number"),
    }
}

fn median(mut numbers: Vec<f64>) -> f64 {
    numbers.sort_by(|a, b| a.total_cmp(b));
    let mid = numbers.len() / 2;
    if numbers.len() % 2 == 0 {
        (numbers[mid - 1] + numbers[mid]) / 2.0
    } else {
        numbers[mid]
    }
}

/// Whole results serialize as integers so `32.0` reads as `32`.
fn to_json_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(op: &str, numbers: Value) -> anyhow::Result<Value> {
        let params = json!({"operation": op, "numbers": numbers});
        let Value::Object(map) = params else { unreachable!() };
        aggregate(map, ExecutionContext::new()).await
    }

    #[tokio::test]
    async fn average_of_scenario_numbers_is_32() {
        let out = run("average", json!([10, 20, 30, 45, 55])).await.unwrap();
        assert_eq!(out["result"], json!(32));
        assert_eq!(out["count"], json!(5));
    }

    #[tokio::test]
    async fn other_operations() {
        assert_eq!(run("sum", json!([1, 2, 3.5])).await.unwrap()["result"], json!(6.5));
        assert_eq!(run("min", json!([4, -1, 9])).await.unwrap()["result"], json!(-1));
        assert_eq!(run("max", json!(["4", "12"])).await.unwrap()["result"], json!(12));
        assert_eq!(run("median", json!([5, 1, 3, 2])).await.unwrap()["result"], json!(2.5));
        assert_eq!(run("count", json!([])).await.unwrap()["result"], json!(0));
    }

    #[tokio::test]
    async fn bad_input_fails() {
        assert!(run("average", json!([])).await.is_err());
        assert!(run("average", json!(["ten"])).await.is_err());
        assert!(run("variance", json!([1])).await.is_err());
    }
}
