use std::collections::HashMap;

use serde_json::{json, Value};

use anyproxy_protocol::claude::{
    ContentBlock, CreateMessageRequestBody, ImageSource, MessageContent, MessageParam,
    MessageRole, ThinkingConfig, ToolChoice as ClaudeToolChoice,
};
use anyproxy_protocol::gemini::{
    Blob, Content, ContentRole, FunctionCall as GeminiFunctionCall, FunctionDeclaration,
    FunctionResponse, GenerateContentRequestBody, GenerationConfig, Part,
    ThinkingConfig as GeminiThinkingConfig, Tool,
};

use crate::helpers::materialize_tool_result;
use crate::thinking;
use crate::types::RequestContext;

/// Convert an Anthropic create-message request into a Gemini generateContent
/// request.
pub fn transform_request(
    body: CreateMessageRequestBody,
    ctx: &RequestContext,
) -> GenerateContentRequestBody {
    let client_requested_thinking = matches!(body.thinking, Some(ThinkingConfig::Enabled { .. }));
    let history_compatible = thinking::claude_history_compatible(&body.messages);

    // tool_use id -> function name, so functionResponse parts can carry the
    // name Gemini correlates on.
    let mut call_names: HashMap<String, String> = HashMap::new();
    for message in &body.messages {
        for block in message.content.blocks() {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                call_names.insert(id.clone(), name.clone());
            }
        }
    }

    let contents = body
        .messages
        .iter()
        .filter_map(|message| map_message(message, &call_names, ctx))
        .collect();

    let system_instruction = body.system.as_ref().and_then(|system| {
        let text = system.joined_text();
        (!text.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part::text(text)],
        })
    });

    let tools = body.tools.as_ref().map(|tools| {
        vec![Tool {
            function_declarations: tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(tool.input_schema.clone()),
                })
                .collect(),
        }]
    });

    let thinking_config = thinking::resolve_thinking(
        client_requested_thinking,
        ctx.target_model,
        history_compatible,
    )
    .then_some(GeminiThinkingConfig {
        include_thoughts: Some(true),
        thinking_budget: None,
    });

    GenerateContentRequestBody {
        contents,
        system_instruction,
        tools,
        tool_config: body.tool_choice.map(map_tool_config),
        generation_config: Some(GenerationConfig {
            temperature: body.temperature,
            top_p: body.top_p,
            max_output_tokens: (body.max_tokens > 0).then_some(body.max_tokens),
            stop_sequences: body.stop_sequences.filter(|stops| !stops.is_empty()),
            thinking_config,
        }),
        safety_settings: None,
        model: None,
        stream: None,
    }
}

fn map_message(
    message: &MessageParam,
    call_names: &HashMap<String, String>,
    ctx: &RequestContext,
) -> Option<Content> {
    let role = match message.role {
        MessageRole::User => ContentRole::User,
        MessageRole::Assistant => ContentRole::Model,
    };

    let mut parts = Vec::new();
    match &message.content {
        MessageContent::Text(text) => {
            if !text.is_empty() {
                parts.push(Part::text(text.clone()));
            }
        }
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            parts.push(Part::text(text.clone()));
                        }
                    }
                    ContentBlock::Thinking {
                        thinking,
                        signature,
                    } => {
                        let signature = signature
                            .clone()
                            .or_else(|| ctx.store.get(ctx.session));
                        parts.push(Part::thought(thinking.clone(), signature));
                    }
                    ContentBlock::ToolUse { id, name, input } => parts.push(Part {
                        function_call: Some(GeminiFunctionCall {
                            name: name.clone(),
                            args: Some(normalize_args(input)),
                            id: Some(id.clone()),
                        }),
                        ..Default::default()
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        let name = call_names
                            .get(tool_use_id)
                            .cloned()
                            .unwrap_or_else(|| tool_use_id.clone());
                        parts.push(Part {
                            function_response: Some(FunctionResponse {
                                name,
                                response: json!({
                                    "result": materialize_tool_result(content.as_ref())
                                }),
                                id: Some(tool_use_id.clone()),
                            }),
                            ..Default::default()
                        });
                    }
                    ContentBlock::Image { source } => {
                        if let ImageSource::Base64 { media_type, data } = source {
                            parts.push(Part {
                                inline_data: Some(Blob {
                                    mime_type: media_type.clone(),
                                    data: data.clone(),
                                }),
                                ..Default::default()
                            });
                        }
                    }
                }
            }
        }
    }

    (!parts.is_empty()).then_some(Content {
        role: Some(role),
        parts,
    })
}

fn normalize_args(input: &Value) -> Value {
    if input.is_object() {
        input.clone()
    } else {
        json!({})
    }
}

fn map_tool_config(choice: ClaudeToolChoice) -> Value {
    match choice {
        ClaudeToolChoice::Auto => json!({"functionCallingConfig": {"mode": "AUTO"}}),
        ClaudeToolChoice::Any => json!({"functionCallingConfig": {"mode": "ANY"}}),
        ClaudeToolChoice::None => json!({"functionCallingConfig": {"mode": "NONE"}}),
        ClaudeToolChoice::Tool { name } => json!({
            "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]}
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureStore;
    use anyproxy_protocol::claude::{SystemPrompt, ToolResultContent};

    fn ctx<'a>(store: &'a SignatureStore) -> RequestContext<'a> {
        RequestContext {
            target_model: "gemini-2.5-pro",
            session: "s",
            store,
            stream: false,
        }
    }

    fn base_body(messages: Vec<MessageParam>) -> CreateMessageRequestBody {
        CreateMessageRequestBody {
            model: "claude-3-5-sonnet".into(),
            messages,
            max_tokens: 128,
            system: Some(SystemPrompt::Text("be helpful".into())),
            temperature: Some(0.2),
            top_p: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
        }
    }

    #[test]
    fn system_and_sampling_map_to_gemini_fields() {
        let store = SignatureStore::new();
        let body = base_body(vec![MessageParam {
            role: MessageRole::User,
            content: MessageContent::Text("hi".into()),
        }]);
        let out = transform_request(body, &ctx(&store));
        assert_eq!(
            out.system_instruction.unwrap().parts[0].text.as_deref(),
            Some("be helpful")
        );
        let config = out.generation_config.unwrap();
        assert_eq!(config.max_output_tokens, Some(128));
        assert_eq!(config.temperature, Some(0.2));
        assert_eq!(out.contents[0].role, Some(ContentRole::User));
    }

    #[test]
    fn tool_result_resolves_the_function_name_from_history() {
        let store = SignatureStore::new();
        let body = base_body(vec![
            MessageParam {
                role: MessageRole::Assistant,
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "toolu_01".into(),
                    name: "get_time".into(),
                    input: json!({"tz": "UTC"}),
                }]),
            },
            MessageParam {
                role: MessageRole::User,
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_01".into(),
                    content: Some(ToolResultContent::Text("12:00Z".into())),
                    is_error: None,
                }]),
            },
        ]);
        let out = transform_request(body, &ctx(&store));
        let call = out.contents[0].parts[0].function_call.as_ref().unwrap();
        assert_eq!(call.name, "get_time");
        let response = out.contents[1].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "get_time");
        assert_eq!(response.id.as_deref(), Some("toolu_01"));
        assert_eq!(response.response["result"], "12:00Z");
    }

    #[test]
    fn thinking_blocks_become_thought_parts_with_repair() {
        let store = SignatureStore::new();
        store.store("s", &"r".repeat(64));
        let body = base_body(vec![MessageParam {
            role: MessageRole::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::Thinking {
                thinking: "mulling".into(),
                signature: None,
            }]),
        }]);
        let out = transform_request(body, &ctx(&store));
        let part = &out.contents[0].parts[0];
        assert!(part.is_thought());
        assert_eq!(part.thought_signature.as_deref().unwrap().len(), 64);
    }

    #[test]
    fn enabled_thinking_requests_thoughts_from_gemini() {
        let store = SignatureStore::new();
        let mut body = base_body(vec![MessageParam {
            role: MessageRole::User,
            content: MessageContent::Text("hi".into()),
        }]);
        body.thinking = Some(ThinkingConfig::Enabled { budget_tokens: 512 });
        let out = transform_request(body, &ctx(&store));
        let config = out.generation_config.unwrap();
        assert_eq!(
            config.thinking_config.unwrap().include_thoughts,
            Some(true)
        );
    }
}
