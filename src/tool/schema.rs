//! Local argument validation against a tool's JSON input schema.
//!
//! Only the subset tool servers actually advertise is checked: `required`,
//! per-property `type` (single or list), `enum`, `additionalProperties: false`,
//! and nested `properties`/`items`. Unknown keywords are accepted.

use crate::error::{BridgeError, Result};
use serde_json::{Map, Value};

/// Check `arguments` against `schema`, failing with `BridgeError::Schema`
pub(crate) fn validate_arguments(
    tool: &str,
    schema: &Value,
    arguments: &Map<String, Value>,
) -> Result<()> {
    check_object(schema, arguments, "").map_err(|message| BridgeError::schema(tool, message))
}

fn check_object(
    schema: &Value,
    object: &Map<String, Value>,
    path: &str,
) -> std::result::Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                return Err(format!(
                    "missing required parameter '{}'",
                    join(path, name)
                ));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = matches!(schema.get("additionalProperties"), Some(Value::Bool(false)));

    for (name, value) in object {
        match properties.and_then(|p| p.get(name)) {
            Some(property) => check_value(property, value, &join(path, name))?,
            None if closed => {
                return Err(format!("unexpected parameter '{}'", join(path, name)));
            }
            None => {}
        }
    }

    Ok(())
}

fn check_value(schema: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
    let Some(rules) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = rules.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
            return Err(format!(
                "parameter '{}' expected {}, got {}",
                path,
                allowed.join(" or "),
                type_name(value)
            ));
        }
    }

    if let Some(choices) = rules.get("enum").and_then(Value::as_array)
        && !choices.contains(value)
    {
        return Err(format!("parameter '{}' is not one of the allowed values", path));
    }

    match value {
        Value::Object(inner) => check_object(schema, inner, path)?,
        Value::Array(items) => {
            if let Some(item_schema) = rules.get("items") {
                for (index, item) in items.iter().enumerate() {
                    check_value(item_schema, item, &format!("{}[{}]", path, index))?;
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type names are not ours to reject
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}
