//! Normalizer for "cursor-mixed" bodies: OpenAI-endpoint requests whose
//! messages and tools follow the Anthropic shape. The output is a clean
//! OpenAI Chat Completions body; thinking-block signatures found along the
//! way are captured into the signature store.

use serde_json::{json, Map, Value};

use crate::schema;
use crate::signature::SignatureStore;

const COPIED_KEYS: &[&str] = &[
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "stream",
    "stop",
    "presence_penalty",
    "frequency_penalty",
    "user",
];

pub fn normalize_cursor_body(body: Value, store: &SignatureStore, session: &str) -> Value {
    let body = match body {
        Value::Object(map) => map,
        other => return other,
    };

    let mut out = Map::new();
    if let Some(model) = body.get("model") {
        out.insert("model".to_string(), model.clone());
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let converted = convert_tools(tools);
        if !converted.is_empty() {
            out.insert("tools".to_string(), Value::Array(converted));
        }
    }

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        out.insert(
            "messages".to_string(),
            Value::Array(convert_messages(messages, store, session)),
        );
    }

    if let Some(choice) = body.get("tool_choice") {
        out.insert("tool_choice".to_string(), convert_tool_choice(choice));
    }

    for key in COPIED_KEYS {
        if let Some(value) = body.get(*key) {
            out.insert((*key).to_string(), value.clone());
        }
    }

    if body.get("stream").and_then(Value::as_bool) == Some(true) {
        out.insert(
            "stream_options".to_string(),
            json!({"include_usage": true}),
        );
    }

    Value::Object(out)
}

/// Accept both flat `{name, description, input_schema}` and nested
/// `{type: "function", function: {...}}` definitions.
fn convert_tools(tools: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(tools.len());
    for tool in tools {
        let Some(tool) = tool.as_object() else {
            continue;
        };
        if let Some(name) = tool.get("name").and_then(Value::as_str) {
            let parameters =
                schema::sanitize(tool.get("input_schema").unwrap_or(&json!({"type": "object"})));
            out.push(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": tool.get("description").and_then(Value::as_str).unwrap_or(""),
                    "parameters": parameters,
                }
            }));
        } else if let Some(function) = tool.get("function").and_then(Value::as_object) {
            let kind = tool.get("type").and_then(Value::as_str).unwrap_or("function");
            if kind != "function" {
                continue;
            }
            let parameters =
                schema::sanitize(function.get("parameters").unwrap_or(&json!({"type": "object"})));
            out.push(json!({
                "type": "function",
                "function": {
                    "name": function.get("name").and_then(Value::as_str).unwrap_or(""),
                    "description": function.get("description").and_then(Value::as_str).unwrap_or(""),
                    "parameters": parameters,
                }
            }));
        }
    }
    out
}

fn convert_messages(messages: &[Value], store: &SignatureStore, session: &str) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let Some(message) = message.as_object() else {
            continue;
        };
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        let content = message.get("content");

        match role {
            "system" => out.push(json!({
                "role": "system",
                "content": text_of(content),
            })),
            "user" => {
                if let Some(blocks) = content.and_then(Value::as_array) {
                    out.extend(convert_user_blocks(blocks));
                } else {
                    out.push(json!({"role": "user", "content": text_of(content)}));
                }
            }
            "assistant" => out.push(convert_assistant(message, store, session)),
            _ => out.push(Value::Object(message.clone())),
        }
    }
    out
}

/// A user turn carrying `tool_result` blocks splits into OpenAI `tool`
/// messages followed by any residual user text.
fn convert_user_blocks(blocks: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    let mut texts = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_result") => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").and_then(Value::as_str).unwrap_or(""),
                    "content": tool_result_text(block.get("content")),
                }));
            }
            _ => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        texts.push(text.to_string());
                    }
                }
            }
        }
    }

    if !texts.is_empty() {
        out.push(json!({"role": "user", "content": texts.join("\n")}));
    }
    out
}

fn convert_assistant(message: &Map<String, Value>, store: &SignatureStore, session: &str) -> Value {
    let content = message.get("content");

    // Already OpenAI-shaped if tool_calls is present at the message level.
    if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
        if !tool_calls.is_empty() {
            let mut out = Map::new();
            out.insert("role".to_string(), json!("assistant"));
            out.insert("tool_calls".to_string(), Value::Array(tool_calls.to_vec()));
            let text = text_of(content);
            if !text.is_empty() {
                out.insert("content".to_string(), json!(text));
            }
            if let Some(reasoning) = message.get("reasoning_content").and_then(Value::as_str) {
                if !reasoning.is_empty() {
                    out.insert("reasoning_content".to_string(), json!(reasoning));
                }
            }
            return Value::Object(out);
        }
    }

    let Some(blocks) = content.and_then(Value::as_array) else {
        let mut out = Map::new();
        out.insert("role".to_string(), json!("assistant"));
        out.insert("content".to_string(), json!(text_of(content)));
        if let Some(reasoning) = message.get("reasoning_content").and_then(Value::as_str) {
            if !reasoning.is_empty() {
                out.insert("reasoning_content".to_string(), json!(reasoning));
            }
        }
        return Value::Object(out);
    };

    let mut texts = Vec::new();
    let mut thinking = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_use") => {
                let input = block.get("input").cloned().unwrap_or(json!({}));
                tool_calls.push(json!({
                    "id": block.get("id").and_then(Value::as_str).unwrap_or(""),
                    "type": "function",
                    "function": {
                        "name": block.get("name").and_then(Value::as_str).unwrap_or(""),
                        "arguments": serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                    }
                }));
            }
            Some("thinking") => {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    if !text.is_empty() {
                        thinking.push(text.to_string());
                    }
                }
                if let Some(signature) = block.get("signature").and_then(Value::as_str) {
                    store.store(session, signature);
                }
            }
            _ => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        texts.push(text.to_string());
                    }
                }
            }
        }
    }

    let mut out = Map::new();
    out.insert("role".to_string(), json!("assistant"));
    if !texts.is_empty() {
        out.insert("content".to_string(), json!(texts.join("\n")));
    }
    if !thinking.is_empty() {
        out.insert("reasoning_content".to_string(), json!(thinking.join("\n")));
    } else if let Some(reasoning) = message.get("reasoning_content").and_then(Value::as_str) {
        if !reasoning.is_empty() {
            out.insert("reasoning_content".to_string(), json!(reasoning));
        }
    }
    if !tool_calls.is_empty() {
        out.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Value::Object(out)
}

fn convert_tool_choice(choice: &Value) -> Value {
    match choice {
        Value::String(mode) => json!(mode),
        Value::Object(map) => match map.get("type").and_then(Value::as_str) {
            Some("auto") => json!("auto"),
            Some("any") => json!("required"),
            Some("tool") => match map.get("name").and_then(Value::as_str) {
                Some(name) => json!({"type": "function", "function": {"name": name}}),
                None => json!("auto"),
            },
            Some("function") => choice.clone(),
            _ => json!("auto"),
        },
        _ => json!("auto"),
    }
}

fn text_of(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => {
            let texts: Vec<&str> = items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            texts.join("\n")
        }
        _ => String::new(),
    }
}

fn tool_result_text(content: Option<&Value>) -> String {
    let text = match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => {
            let parts: Vec<String> = items
                .iter()
                .map(|item| {
                    if item.get("type").and_then(Value::as_str) == Some("text") {
                        item.get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    } else if let Some(text) = item.as_str() {
                        text.to_string()
                    } else {
                        item.to_string()
                    }
                })
                .filter(|part| !part.is_empty())
                .collect();
            parts.join("\n")
        }
        Some(other) => other.to_string(),
        None => String::new(),
    };
    if text.is_empty() {
        crate::helpers::EMPTY_TOOL_RESULT.to_string()
    } else {
        text
    }
}
