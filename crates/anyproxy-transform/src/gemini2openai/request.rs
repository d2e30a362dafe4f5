use serde_json::Value;

use anyproxy_protocol::gemini::{
    Content, ContentRole, GenerateContentRequestBody, Part,
};
use anyproxy_protocol::openai::{
    ChatCompletionRequestBody, ChatMessage, FunctionCall, FunctionDefinition, StopSequences,
    TextOrParts, ToolCall, ToolCallKind, ToolDefinition,
};

use crate::helpers::{arguments_string, materialize_placeholder, synth_call_id};
use crate::thinking;
use crate::types::RequestContext;

/// Convert a Gemini generateContent request into an OpenAI chat-completions
/// request.
pub fn transform_request(
    body: GenerateContentRequestBody,
    ctx: &RequestContext,
) -> ChatCompletionRequestBody {
    let client_requested_thinking = body
        .generation_config
        .as_ref()
        .and_then(|config| config.thinking_config.as_ref())
        .and_then(|config| config.include_thoughts)
        .unwrap_or(false);
    let history_compatible = thinking::gemini_history_compatible(&body.contents);

    let mut messages = Vec::new();

    if let Some(system) = &body.system_instruction {
        let text = parts_text(&system.parts);
        if !text.is_empty() {
            messages.push(ChatMessage::System {
                content: TextOrParts::Text(text),
            });
        }
    }

    for content in &body.contents {
        match content.role {
            Some(ContentRole::Model) => messages.push(map_model_content(content, ctx)),
            _ => map_user_content(content, &mut messages),
        }
    }

    let tools = body.tools.as_ref().map(|tools| {
        tools
            .iter()
            .flat_map(|tool| &tool.function_declarations)
            .map(|declaration| ToolDefinition {
                kind: ToolCallKind::Function,
                function: FunctionDefinition {
                    name: declaration.name.clone(),
                    description: declaration.description.clone(),
                    parameters: declaration.parameters.clone(),
                    strict: None,
                },
            })
            .collect::<Vec<_>>()
    });

    let config = body.generation_config.unwrap_or_default();
    let reasoning_effort = thinking::resolve_thinking(
        client_requested_thinking,
        ctx.target_model,
        history_compatible,
    )
    .then(|| "medium".to_string())
    .filter(|_| client_requested_thinking);

    let mut out = ChatCompletionRequestBody {
        model: ctx.target_model.to_string(),
        messages,
        tools,
        tool_choice: None,
        temperature: config.temperature,
        top_p: config.top_p,
        max_tokens: config.max_output_tokens,
        max_completion_tokens: None,
        stop: config
            .stop_sequences
            .filter(|stops| !stops.is_empty())
            .map(StopSequences::Many),
        stream: ctx.stream.then_some(true),
        stream_options: None,
        reasoning_effort,
        user: None,
    };
    out.ensure_stream_usage();
    out
}

fn map_user_content(content: &Content, messages: &mut Vec<ChatMessage>) {
    let mut texts = Vec::new();
    for part in &content.parts {
        if let Some(response) = &part.function_response {
            messages.push(ChatMessage::Tool {
                tool_call_id: response
                    .id
                    .clone()
                    .unwrap_or_else(|| response.name.clone()),
                content: TextOrParts::Text(materialize_placeholder(function_response_text(
                    &response.response,
                ))),
            });
        } else if let Some(text) = part.text.as_deref() {
            if !text.is_empty() {
                texts.push(text.to_string());
            }
        }
    }
    if !texts.is_empty() {
        messages.push(ChatMessage::User {
            content: TextOrParts::Text(texts.join("\n")),
        });
    }
}

fn map_model_content(content: &Content, ctx: &RequestContext) -> ChatMessage {
    let mut texts = Vec::new();
    let mut reasoning = Vec::new();
    let mut tool_calls = Vec::new();

    for part in &content.parts {
        if let Some(call) = &part.function_call {
            tool_calls.push(ToolCall {
                id: call.id.clone().unwrap_or_else(|| synth_call_id(&call.name)),
                kind: ToolCallKind::Function,
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments: call
                        .args
                        .as_ref()
                        .map(arguments_string)
                        .unwrap_or_else(|| "{}".to_string()),
                },
            });
        } else if let Some(text) = part.text.as_deref() {
            if text.is_empty() {
                continue;
            }
            if part.is_thought() {
                reasoning.push(text.to_string());
                if let Some(signature) = part.thought_signature.as_deref() {
                    ctx.store.store(ctx.session, signature);
                }
            } else {
                texts.push(text.to_string());
            }
        }
    }

    ChatMessage::Assistant {
        content: (!texts.is_empty()).then(|| TextOrParts::Text(texts.join("\n"))),
        reasoning_content: (!reasoning.is_empty()).then(|| reasoning.join("\n")),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
    }
}

fn parts_text(parts: &[Part]) -> String {
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .filter(|text| !text.is_empty())
        .collect();
    texts.join("\n")
}

/// Gemini shapes `functionResponse.response` as `{result: <string>}`; fall
/// back to serializing anything else.
fn function_response_text(response: &Value) -> String {
    match response.get("result") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => {
            if response.is_null() {
                String::new()
            } else {
                response.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureStore;
    use anyproxy_protocol::gemini::{FunctionCall as GeminiFunctionCall, FunctionResponse};
    use serde_json::json;

    fn ctx<'a>(store: &'a SignatureStore) -> RequestContext<'a> {
        RequestContext {
            target_model: "gpt-4o",
            session: "s",
            store,
            stream: false,
        }
    }

    #[test]
    fn contents_map_to_chat_messages() {
        let store = SignatureStore::new();
        let body = GenerateContentRequestBody {
            contents: vec![
                Content {
                    role: Some(ContentRole::User),
                    parts: vec![Part::text("time?")],
                },
                Content {
                    role: Some(ContentRole::Model),
                    parts: vec![Part {
                        function_call: Some(GeminiFunctionCall {
                            name: "get_time".into(),
                            args: Some(json!({"tz": "UTC"})),
                            id: Some("call_9".into()),
                        }),
                        ..Default::default()
                    }],
                },
                Content {
                    role: Some(ContentRole::User),
                    parts: vec![Part {
                        function_response: Some(FunctionResponse {
                            name: "get_time".into(),
                            response: json!({"result": "12:00Z"}),
                            id: Some("call_9".into()),
                        }),
                        ..Default::default()
                    }],
                },
            ],
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::text("be precise")],
            }),
            ..Default::default()
        };
        let out = transform_request(body, &ctx(&store));
        assert!(matches!(&out.messages[0], ChatMessage::System { .. }));
        assert!(matches!(&out.messages[1], ChatMessage::User { .. }));
        match &out.messages[2] {
            ChatMessage::Assistant { tool_calls, .. } => {
                let call = &tool_calls.as_ref().unwrap()[0];
                assert_eq!(call.id, "call_9");
                assert_eq!(call.function.arguments, r#"{"tz":"UTC"}"#);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        match &out.messages[3] {
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "call_9");
                assert_eq!(content.joined_text(), "12:00Z");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn thought_parts_fold_into_reasoning_content() {
        let store = SignatureStore::new();
        let sig = "w".repeat(70);
        let body = GenerateContentRequestBody {
            contents: vec![Content {
                role: Some(ContentRole::Model),
                parts: vec![
                    Part::thought("pondering", Some(sig.clone())),
                    Part::text("answer"),
                ],
            }],
            ..Default::default()
        };
        let out = transform_request(body, &ctx(&store));
        match &out.messages[0] {
            ChatMessage::Assistant {
                content,
                reasoning_content,
                ..
            } => {
                assert_eq!(reasoning_content.as_deref(), Some("pondering"));
                assert_eq!(content.as_ref().unwrap().joined_text(), "answer");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(store.get("s").unwrap(), sig);
    }
}
