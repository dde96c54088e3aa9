//! Tool schema helpers: the LM-facing tool format, structural argument
//! validation, and path-argument extraction for the sandbox.
//!
//! Validation covers the JSON-Schema subset tool schemas actually use —
//! `type`, `properties`, `required`, `enum`, array `items`, and
//! `additionalProperties: false` — which is enough to reject a malformed
//! argument set before it reaches a provider. Anything deeper is the
//! provider's own concern.

use serde_json::Value;

use super::traits::ToolDescriptor;
use crate::ai::types::ToolSpec;

/// Convert a registry descriptor into the uniform LM tool format.
pub fn descriptor_to_llm_format(descriptor: &ToolDescriptor) -> ToolSpec {
    ToolSpec {
        name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        input_schema: descriptor.input_schema.clone(),
    }
}

/// Validate an argument object against a tool's input schema.
///
/// Returns `Err` with a human-readable reason on the first violation found.
pub fn validate_arguments(schema: &Value, args: &Value) -> std::result::Result<(), String> {
    validate_value(schema, args, "$")
}

fn validate_value(schema: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        // A non-object schema constrains nothing.
        return Ok(());
    };

    if let Some(expected) = schema_obj.get("type").and_then(|t| t.as_str()) {
        if !type_matches(expected, value) {
            return Err(format!("{path}: expected {expected}, got {}", type_name(value)));
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
            for name in required.iter().filter_map(|r| r.as_str()) {
                if !obj.contains_key(name) {
                    return Err(format!("{path}: missing required property '{name}'"));
                }
            }
        }
        let properties = schema_obj.get("properties").and_then(|p| p.as_object());
        if let Some(properties) = properties {
            for (key, prop_value) in obj {
                if let Some(prop_schema) = properties.get(key) {
                    validate_value(prop_schema, prop_value, &format!("{path}.{key}"))?;
                } else if schema_obj.get("additionalProperties") == Some(&Value::Bool(false)) {
                    return Err(format!("{path}: unexpected property '{key}'"));
                }
            }
        }
    }

    if let (Some(items), Some(array)) = (schema_obj.get("items"), value.as_array()) {
        for (i, item) in array.iter().enumerate() {
            validate_value(items, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
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

/// Collect the string argument values whose property names hint at a
/// filesystem path. These are the values the sandbox validates.
pub fn path_arguments(schema: &Value, args: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    let Some(obj) = args.as_object() else {
        return paths;
    };
    let properties = schema
        .as_object()
        .and_then(|s| s.get("properties"))
        .and_then(|p| p.as_object());

    for (key, value) in obj {
        let Some(s) = value.as_str() else { continue };
        let key_lower = key.to_lowercase();
        let name_hints = key_lower.contains("path")
            || key_lower.contains("file")
            || key_lower.contains("dir");
        let format_hints = properties
            .and_then(|p| p.get(key))
            .and_then(|p| p.get("format"))
            .and_then(|f| f.as_str())
            == Some("path");
        if name_hints || format_hints {
            paths.push(s.to_string());
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::traits::PermissionLevel;
    use serde_json::json;

    fn file_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "mode": {"type": "string", "enum": ["read", "write"]},
                "limit": {"type": "integer"}
            },
            "required": ["path"]
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let args = json!({"path": "/tmp/x", "mode": "read", "limit": 10});
        assert!(validate_arguments(&file_schema(), &args).is_ok());
    }

    #[test]
    fn missing_required_property_fails() {
        let args = json!({"mode": "read"});
        let err = validate_arguments(&file_schema(), &args).unwrap_err();
        assert!(err.contains("path"));
    }

    #[test]
    fn wrong_type_fails() {
        let args = json!({"path": 42});
        let err = validate_arguments(&file_schema(), &args).unwrap_err();
        assert!(err.contains("expected string"));
    }

    #[test]
    fn enum_violation_fails() {
        let args = json!({"path": "/x", "mode": "append"});
        assert!(validate_arguments(&file_schema(), &args).is_err());
    }

    #[test]
    fn additional_properties_false_rejects_extras() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false
        });
        let args = json!({"a": "x", "b": "y"});
        assert!(validate_arguments(&schema, &args).is_err());
    }

    #[test]
    fn extras_allowed_by_default() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        let args = json!({"a": "x", "b": "y"});
        assert!(validate_arguments(&schema, &args).is_ok());
    }

    #[test]
    fn array_items_validated() {
        let schema = json!({
            "type": "object",
            "properties": {"names": {"type": "array", "items": {"type": "string"}}}
        });
        assert!(validate_arguments(&schema, &json!({"names": ["a", "b"]})).is_ok());
        assert!(validate_arguments(&schema, &json!({"names": ["a", 1]})).is_err());
    }

    #[test]
    fn non_object_schema_accepts_anything() {
        assert!(validate_arguments(&Value::Null, &json!({"x": 1})).is_ok());
    }

    #[test]
    fn descriptor_converts_to_llm_format() {
        let descriptor = ToolDescriptor {
            name: "read_file".into(),
            description: "Read a file".into(),
            input_schema: file_schema(),
            provider_id: "builtin".into(),
            permission_level: PermissionLevel::Read,
            requires_confirmation: false,
        };
        let spec = descriptor_to_llm_format(&descriptor);
        assert_eq!(spec.name, "read_file");
        assert_eq!(spec.input_schema["properties"]["path"]["type"], "string");
    }

    #[test]
    fn path_arguments_found_by_name_hint() {
        let args = json!({"path": "/a", "file_name": "/b", "out_dir": "/c", "query": "not a path"});
        let mut found = path_arguments(&json!({}), &args);
        found.sort();
        assert_eq!(found, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn path_arguments_found_by_format_hint() {
        let schema = json!({
            "type": "object",
            "properties": {"target": {"type": "string", "format": "path"}}
        });
        let args = json!({"target": "/etc/hosts"});
        assert_eq!(path_arguments(&schema, &args), vec!["/etc/hosts"]);
    }

    #[test]
    fn non_string_values_are_not_paths() {
        let args = json!({"path": 42});
        assert!(path_arguments(&json!({}), &args).is_empty());
    }
}
