//! Request-body format detection.
//!
//! Endpoints imply a dialect, but clients do not always honour it: Cursor
//! posts Anthropic-style blocks and flat tool definitions to the OpenAI
//! endpoint. The detector inspects the decoded body and classifies it,
//! falling back to the endpoint's implied dialect when signals are ambiguous.

use serde_json::Value;

use crate::types::Proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedFormat {
    OpenAI,
    Anthropic,
    /// Anthropic-flavoured payload arriving on the OpenAI endpoint.
    CursorMixed,
    Gemini,
}

impl DetectedFormat {
    pub fn proto(&self) -> Proto {
        match self {
            DetectedFormat::OpenAI | DetectedFormat::CursorMixed => Proto::OpenAI,
            DetectedFormat::Anthropic => Proto::Claude,
            DetectedFormat::Gemini => Proto::Gemini,
        }
    }
}

pub fn detect_format(body: &Value, endpoint: Proto) -> DetectedFormat {
    if body.get("contents").is_some_and(Value::is_array) && body.get("messages").is_none() {
        return DetectedFormat::Gemini;
    }

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        if has_anthropic_blocks(messages) || has_flat_tools(body) {
            return if endpoint == Proto::OpenAI {
                DetectedFormat::CursorMixed
            } else {
                DetectedFormat::Anthropic
            };
        }
    }

    match endpoint {
        Proto::OpenAI => DetectedFormat::OpenAI,
        Proto::Claude => DetectedFormat::Anthropic,
        Proto::Gemini => DetectedFormat::Gemini,
    }
}

fn has_anthropic_blocks(messages: &[Value]) -> bool {
    messages.iter().any(|message| {
        message
            .get("content")
            .and_then(Value::as_array)
            .is_some_and(|blocks| {
                blocks.iter().any(|block| {
                    matches!(
                        block.get("type").and_then(Value::as_str),
                        Some("thinking" | "tool_use" | "tool_result")
                    )
                })
            })
    })
}

/// Anthropic tool definitions carry a top-level `name` with no
/// `type: "function"` wrapper.
fn has_flat_tools(body: &Value) -> bool {
    body.get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| {
            tools
                .iter()
                .any(|tool| tool.get("name").is_some() && tool.get("function").is_none())
        })
}
