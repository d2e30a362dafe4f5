//! Small shared helpers used across the directional transcoders.

use serde_json::Value;

use anyproxy_protocol::claude::{ContentBlock, ToolResultContent};

pub const EMPTY_TOOL_RESULT: &str = "(empty result)";

/// Canonicalize a tool result to a single string: text blocks joined by
/// newline, anything else serialized as JSON, empty input replaced by a
/// literal placeholder so upstreams never see an empty function response.
pub fn materialize_tool_result(content: Option<&ToolResultContent>) -> String {
    let Some(content) = content else {
        return EMPTY_TOOL_RESULT.to_string();
    };
    let text = match content {
        ToolResultContent::Text(text) => text.clone(),
        ToolResultContent::Blocks(blocks) => {
            let parts: Vec<String> = blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => text.clone(),
                    other => serde_json::to_string(other).unwrap_or_default(),
                })
                .filter(|part| !part.is_empty())
                .collect();
            parts.join("\n")
        }
    };
    if text.is_empty() {
        EMPTY_TOOL_RESULT.to_string()
    } else {
        text
    }
}

/// Replace an empty tool-result string with the canonical placeholder.
pub fn materialize_placeholder(text: String) -> String {
    if text.is_empty() {
        EMPTY_TOOL_RESULT.to_string()
    } else {
        text
    }
}

/// Decode a JSON-string tool-call argument payload. Anything that is not an
/// object is wrapped so the target protocol always sees one.
pub fn parse_tool_arguments(arguments: &str) -> Value {
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => {
            let mut map = serde_json::Map::new();
            map.insert("arguments".to_string(), other);
            Value::Object(map)
        }
        Err(_) => {
            let mut map = serde_json::Map::new();
            map.insert(
                "arguments".to_string(),
                Value::String(arguments.to_string()),
            );
            Value::Object(map)
        }
    }
}

/// Serialize tool-call input for protocols that carry arguments as a JSON
/// string.
pub fn arguments_string(input: &Value) -> String {
    if input.is_null() {
        return "{}".to_string();
    }
    serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string())
}

pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn now_nanos() -> i128 {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos()
}

/// Synthesised correlation id for tool calls on protocols without a stable
/// one (Gemini).
pub fn synth_call_id(name: &str) -> String {
    format!("call_{}_{}", now_unix(), name)
}

pub fn synth_message_id(prefix: &str) -> String {
    format!("{}_{:x}", prefix, now_nanos())
}

/// Parse a `data:<mime>;base64,<payload>` URL.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}
