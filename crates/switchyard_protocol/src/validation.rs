use jsonschema::Validator;
use once_cell::sync::Lazy;
use serde_json::{Value, json};

use crate::error::ProtocolError;

/// The fixed wire shape every message is checked against before it is
/// accepted or published.
pub fn message_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["id", "content", "timestamp"],
        "properties": {
            "id": { "type": "string", "minLength": 1 },
            "content": { "type": "string" },
            "metadata": { "type": "object" },
            "timestamp": { "type": "string", "format": "date-time" }
        }
    })
}

static VALIDATOR: Lazy<Result<Validator, String>> = Lazy::new(|| {
    jsonschema::options()
        .should_validate_formats(true)
        .build(&message_schema())
        .map_err(|e| e.to_string())
});

pub fn validate_value(value: &Value) -> Result<(), ProtocolError> {
    let validator = VALIDATOR
        .as_ref()
        .map_err(|e| ProtocolError::Schema(format!("message schema is invalid: {e}")))?;

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|err| {
            let path = err.instance_path.to_string();
            if path.is_empty() {
                err.to_string()
            } else {
                format!("{path}: {err}")
            }
        })
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::Schema(errors.join("; ")))
    }
}
