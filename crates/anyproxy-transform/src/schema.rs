//! JSON-Schema sanitizer.
//!
//! Tool parameter schemas written for one protocol routinely carry keywords
//! the strictest accepting protocol (Gemini) rejects. The sanitizer reduces
//! any input to the subset all three upstreams accept. It is pure and
//! structurally idempotent: `sanitize(sanitize(s)) == sanitize(s)`.

use serde_json::{Map, Value};

/// Keywords no downstream needs and Gemini rejects outright.
const DROP_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "title",
    "default",
    "additionalProperties",
    "strict",
    "minLength",
    "maxLength",
    "pattern",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "uniqueItems",
    "minItems",
    "maxItems",
    "not",
    "if",
    "then",
    "else",
];

/// Sanitize a schema for OpenAI/Anthropic upstreams (type names untouched).
pub fn sanitize(schema: &Value) -> Value {
    sanitize_value(schema, false)
}

/// Sanitize a schema for a Gemini upstream; additionally uppercases type
/// names (`STRING`, `OBJECT`, ...), which is the dialect Gemini declares.
pub fn sanitize_for_gemini(schema: &Value) -> Value {
    sanitize_value(schema, true)
}

fn sanitize_value(value: &Value, gemini: bool) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_object(map, gemini)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(item, gemini))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn sanitize_object(map: &Map<String, Value>, gemini: bool) -> Map<String, Value> {
    let mut result = Map::new();

    for (key, value) in map {
        if DROP_KEYS.contains(&key.as_str()) || key == "oneOf" || key == "allOf" {
            continue;
        }

        match key.as_str() {
            "anyOf" => {
                if let Some(branch) = pick_any_of_branch(value) {
                    for (branch_key, branch_value) in sanitize_object(branch, gemini) {
                        result.entry(branch_key).or_insert(branch_value);
                    }
                }
            }
            "required" => {
                if value.as_array().is_some_and(|items| !items.is_empty()) {
                    result.insert(key.clone(), value.clone());
                }
            }
            "type" => {
                if let Some(name) = collapse_type(value) {
                    let name = if gemini {
                        name.to_ascii_uppercase()
                    } else {
                        name
                    };
                    result.insert(key.clone(), Value::String(name));
                } else {
                    result.insert(key.clone(), sanitize_value(value, gemini));
                }
            }
            _ => {
                result.insert(key.clone(), sanitize_value(value, gemini));
            }
        }
    }

    if is_object_type(result.get("type")) && !result.contains_key("properties") {
        result.insert("properties".to_string(), Value::Object(Map::new()));
    }

    result
}

/// `anyOf` is inlined to its first branch that is neither `type: "null"` nor
/// a `not` constraint; parent keys win over merged branch keys.
fn pick_any_of_branch(value: &Value) -> Option<&Map<String, Value>> {
    value.as_array()?.iter().find_map(|option| {
        let map = option.as_object()?;
        if map.get("type").and_then(Value::as_str) == Some("null") {
            return None;
        }
        if map.contains_key("not") {
            return None;
        }
        Some(map)
    })
}

/// `["string","null"]` style unions collapse to the first non-null entry.
fn collapse_type(value: &Value) -> Option<String> {
    match value {
        Value::String(name) => Some(name.clone()),
        Value::Array(entries) => entries
            .iter()
            .filter_map(Value::as_str)
            .find(|name| !name.eq_ignore_ascii_case("null"))
            .map(|name| name.to_string()),
        _ => None,
    }
}

fn is_object_type(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .is_some_and(|name| name.eq_ignore_ascii_case("object"))
}
