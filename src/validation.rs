//! Tool-argument validation and intent tracing.
//!
//! Arguments are checked against each tool's JSON Schema before execution.
//! When intent tracing is on, a reserved `_i` string property is injected
//! into every schema sent to the LLM and stripped back out of the arguments
//! before validation, becoming the call's `intent`.

use serde_json::{json, Map, Value};

/// Reserved property name for intent tracing.
pub const INTENT_PROPERTY: &str = "_i";

const INTENT_DESCRIPTION: &str =
    "One short sentence describing what this call does, shown to the user while the tool runs.";

/// Validate `args` against `schema`. Returns a human-readable error listing
/// the first few violations; the arguments themselves are never modified.
pub fn validate_tool_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| format!("invalid parameter schema: {e}"))?;

    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path().to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{path}: {e}")
            }
        })
        .take(3)
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Inject the reserved `_i` property into a tool parameter schema: first in
/// property order and required.
pub fn inject_intent_property(schema: &Value) -> Value {
    let mut root = match schema {
        Value::Object(obj) => obj.clone(),
        _ => Map::new(),
    };

    let mut properties = Map::new();
    properties.insert(
        INTENT_PROPERTY.to_string(),
        json!({"type": "string", "description": INTENT_DESCRIPTION}),
    );
    if let Some(Value::Object(existing)) = root.get("properties") {
        for (k, v) in existing {
            if k != INTENT_PROPERTY {
                properties.insert(k.clone(), v.clone());
            }
        }
    }
    root.insert("properties".to_string(), Value::Object(properties));

    let mut required = vec![Value::String(INTENT_PROPERTY.to_string())];
    if let Some(Value::Array(existing)) = root.get("required") {
        for v in existing {
            if v.as_str() != Some(INTENT_PROPERTY) {
                required.push(v.clone());
            }
        }
    }
    root.insert("required".to_string(), Value::Array(required));

    if !root.contains_key("type") {
        root.insert("type".to_string(), json!("object"));
    }

    Value::Object(root)
}

/// Strip `_i` from tool-call arguments. Returns the cleaned arguments and
/// the trimmed intent, if non-empty.
pub fn split_intent(args: Value) -> (Value, Option<String>) {
    let mut obj = match args {
        Value::Object(obj) => obj,
        other => return (other, None),
    };
    let intent = obj
        .remove(INTENT_PROPERTY)
        .and_then(|v| v.as_str().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());
    (Value::Object(obj), intent)
}
