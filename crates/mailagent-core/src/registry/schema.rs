//! Validation for the JSON schema subset used by capability descriptors
//!
//! Supported keywords: `type`, `properties`, `required`,
//! `additionalProperties: false`, `enum`, `minimum`, `maximum`,
//! `minLength`, `minItems`, `maxItems`, `items`. Anything else is ignored.

use std::fmt;

use serde_json::Value;

/// First schema violation found in a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON path of the offending value (`$.to[1]`)
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate `value` against `schema`
pub fn validate(schema: &Value, value: &Value) -> Result<(), SchemaViolation> {
    validate_at(schema, value, "$")
}

fn violation(path: &str, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !matches_type(expected, value) {
            return Err(violation(
                path,
                format!("expected {}, found {}", expected, type_name(value)),
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(violation(path, format!("must be one of {}", Value::Array(allowed.clone()))));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(violation(path, format!("must be >= {}", min)));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(violation(path, format!("must be <= {}", max)));
            }
        }
    }

    if let Some(s) = value.as_str() {
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if (s.chars().count() as u64) < min {
                return Err(violation(path, format!("must be at least {} characters", min)));
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                return Err(violation(path, format!("must contain at least {} items", min)));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if items.len() as u64 > max {
                return Err(violation(path, format!("must contain at most {} items", max)));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                validate_at(item_schema, item, &format!("{}[{}]", path, i))?;
            }
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    return Err(violation(path, format!("missing required property '{}'", key)));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

        for (key, child) in object {
            let child_path = format!("{}.{}", path, key);
            match properties.and_then(|p| p.get(key)) {
                Some(child_schema) => validate_at(child_schema, child, &child_path)?,
                None if closed => {
                    return Err(violation(&child_path, "unexpected property"));
                }
                None => {}
            }
        }
    }

    Ok(())
}
