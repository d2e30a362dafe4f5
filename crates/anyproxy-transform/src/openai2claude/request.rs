use serde_json::json;

use anyproxy_protocol::claude::{
    ContentBlock, CreateMessageRequestBody, ImageSource, MessageContent, MessageParam,
    MessageRole, SystemPrompt, ThinkingConfig, ToolChoice as ClaudeToolChoice,
    ToolDefinition as ClaudeTool, ToolResultContent,
};
use anyproxy_protocol::openai::{
    ChatCompletionRequestBody, ChatMessage, ContentPart, TextOrParts, ToolCall, ToolChoice,
};

use crate::helpers::{materialize_placeholder, parse_data_url, parse_tool_arguments};
use crate::thinking;
use crate::types::RequestContext;

const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_THINKING_BUDGET: u32 = 1024;

/// Convert an OpenAI chat-completions request into an Anthropic
/// create-message request.
pub fn transform_request(
    body: ChatCompletionRequestBody,
    ctx: &RequestContext,
) -> CreateMessageRequestBody {
    let client_requested_thinking = body
        .reasoning_effort
        .as_deref()
        .is_some_and(|effort| effort != "none");

    let mut system_texts = Vec::new();
    let mut messages: Vec<MessageParam> = Vec::new();

    for message in &body.messages {
        match message {
            ChatMessage::System { content } | ChatMessage::Developer { content } => {
                let text = content.joined_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            ChatMessage::User { content } => messages.push(map_user_message(content)),
            ChatMessage::Assistant {
                content,
                reasoning_content,
                tool_calls,
            } => messages.push(map_assistant_message(
                content.as_ref(),
                reasoning_content.as_deref(),
                tool_calls.as_deref(),
                ctx,
            )),
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => push_tool_result(&mut messages, tool_call_id, content),
        }
    }

    let system = if system_texts.is_empty() {
        None
    } else {
        Some(SystemPrompt::Text(system_texts.join("\n\n")))
    };

    let tools = body.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| ClaudeTool {
                name: tool.function.name.clone(),
                description: Some(tool.function.description.clone().unwrap_or_default()),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect::<Vec<_>>()
    });

    let history_compatible = thinking::claude_history_compatible(&messages);
    let thinking = if thinking::resolve_thinking(
        client_requested_thinking,
        ctx.target_model,
        history_compatible,
    ) {
        Some(ThinkingConfig::Enabled {
            budget_tokens: DEFAULT_THINKING_BUDGET,
        })
    } else {
        None
    };

    CreateMessageRequestBody {
        model: ctx.target_model.to_string(),
        messages,
        max_tokens: body
            .max_completion_tokens
            .or(body.max_tokens)
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        system,
        temperature: body.temperature.map(|value| value.clamp(0.0, 1.0)),
        top_p: body.top_p,
        stop_sequences: body.stop.map(|stop| {
            stop.into_vec()
                .into_iter()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect()
        }),
        stream: ctx.stream.then_some(true),
        tools,
        tool_choice: body.tool_choice.map(map_tool_choice),
        thinking,
        metadata: None,
    }
}

fn map_user_message(content: &TextOrParts) -> MessageParam {
    let content = match content {
        TextOrParts::Text(text) => MessageContent::Text(text.clone()),
        TextOrParts::Parts(parts) => {
            let mut blocks = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            blocks.push(ContentBlock::text(text.clone()));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        blocks.push(ContentBlock::Image {
                            source: map_image_source(&image_url.url),
                        });
                    }
                }
            }
            collapse_single_text(blocks)
        }
    };
    MessageParam {
        role: MessageRole::User,
        content,
    }
}

fn map_assistant_message(
    content: Option<&TextOrParts>,
    reasoning: Option<&str>,
    tool_calls: Option<&[ToolCall]>,
    ctx: &RequestContext,
) -> MessageParam {
    let mut blocks = Vec::new();

    // Thinking leads the turn; the best-known signature is attached and the
    // invalid-thinking filter validates it before dispatch.
    if let Some(reasoning) = reasoning.filter(|text| !text.is_empty()) {
        blocks.push(ContentBlock::Thinking {
            thinking: reasoning.to_string(),
            signature: ctx.store.get(ctx.session),
        });
    }

    if let Some(content) = content {
        let text = content.joined_text();
        if !text.is_empty() {
            blocks.push(ContentBlock::text(text));
        }
    }

    for call in tool_calls.unwrap_or_default() {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input: parse_tool_arguments(&call.function.arguments),
        });
    }

    if blocks.is_empty() {
        blocks.push(ContentBlock::text(""));
    }

    MessageParam {
        role: MessageRole::Assistant,
        content: MessageContent::Blocks(blocks),
    }
}

/// Consecutive tool replies collapse into one user turn carrying multiple
/// `tool_result` blocks.
fn push_tool_result(messages: &mut Vec<MessageParam>, tool_call_id: &str, content: &TextOrParts) {
    let block = ContentBlock::ToolResult {
        tool_use_id: tool_call_id.to_string(),
        content: Some(ToolResultContent::Text(materialize_placeholder(
            content.joined_text(),
        ))),
        is_error: None,
    };

    if let Some(last) = messages.last_mut() {
        if last.role == MessageRole::User {
            if let MessageContent::Blocks(blocks) = &mut last.content {
                let all_results = blocks
                    .iter()
                    .all(|block| matches!(block, ContentBlock::ToolResult { .. }));
                if all_results {
                    blocks.push(block);
                    return;
                }
            }
        }
    }

    messages.push(MessageParam {
        role: MessageRole::User,
        content: MessageContent::Blocks(vec![block]),
    });
}

fn map_tool_choice(choice: ToolChoice) -> ClaudeToolChoice {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "none" => ClaudeToolChoice::None,
            "required" => ClaudeToolChoice::Any,
            _ => ClaudeToolChoice::Auto,
        },
        ToolChoice::Named(named) => ClaudeToolChoice::Tool {
            name: named.function.name,
        },
    }
}

fn map_image_source(url: &str) -> ImageSource {
    match parse_data_url(url) {
        Some((media_type, data)) => ImageSource::Base64 { media_type, data },
        None => ImageSource::Url {
            url: url.to_string(),
        },
    }
}

fn collapse_single_text(blocks: Vec<ContentBlock>) -> MessageContent {
    if blocks.len() == 1 {
        if let ContentBlock::Text { text } = &blocks[0] {
            return MessageContent::Text(text.clone());
        }
    }
    MessageContent::Blocks(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureStore;
    use serde_json::json;

    fn ctx<'a>(store: &'a SignatureStore) -> RequestContext<'a> {
        RequestContext {
            target_model: "claude-3-5-sonnet",
            session: "sess",
            store,
            stream: false,
        }
    }

    fn base_body(messages: Vec<ChatMessage>) -> ChatCompletionRequestBody {
        ChatCompletionRequestBody {
            model: "gpt-4o".into(),
            messages,
            tools: None,
            tool_choice: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            max_completion_tokens: None,
            stop: None,
            stream: None,
            stream_options: None,
            reasoning_effort: None,
            user: None,
        }
    }

    #[test]
    fn system_messages_hoist_to_top_level() {
        let store = SignatureStore::new();
        let body = base_body(vec![
            ChatMessage::System {
                content: TextOrParts::Text("one".into()),
            },
            ChatMessage::System {
                content: TextOrParts::Text("two".into()),
            },
            ChatMessage::User {
                content: TextOrParts::Text("hi".into()),
            },
        ]);
        let out = transform_request(body, &ctx(&store));
        match out.system.unwrap() {
            SystemPrompt::Text(text) => assert_eq!(text, "one\n\ntwo"),
            other => panic!("unexpected system: {other:?}"),
        }
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.model, "claude-3-5-sonnet");
    }

    #[test]
    fn tool_definitions_flatten_with_empty_description() {
        let store = SignatureStore::new();
        let mut body = base_body(vec![ChatMessage::User {
            content: TextOrParts::Text("time?".into()),
        }]);
        let schema = json!({
            "type": "object",
            "properties": {"tz": {"type": "string"}},
            "required": ["tz"]
        });
        body.tools = Some(vec![anyproxy_protocol::openai::ToolDefinition {
            kind: anyproxy_protocol::openai::ToolCallKind::Function,
            function: anyproxy_protocol::openai::FunctionDefinition {
                name: "get_time".into(),
                description: None,
                parameters: Some(schema.clone()),
                strict: None,
            },
        }]);
        let out = transform_request(body, &ctx(&store));
        let tools = out.tools.unwrap();
        assert_eq!(tools[0].name, "get_time");
        assert_eq!(tools[0].description.as_deref(), Some(""));
        assert_eq!(tools[0].input_schema, schema);
    }

    #[test]
    fn tool_replies_become_tool_result_blocks_after_the_assistant_turn() {
        let store = SignatureStore::new();
        let body = base_body(vec![
            ChatMessage::User {
                content: TextOrParts::Text("time?".into()),
            },
            ChatMessage::Assistant {
                content: None,
                reasoning_content: None,
                tool_calls: Some(vec![ToolCall {
                    id: "toolu_01".into(),
                    kind: anyproxy_protocol::openai::ToolCallKind::Function,
                    function: anyproxy_protocol::openai::FunctionCall {
                        name: "get_time".into(),
                        arguments: r#"{"tz":"UTC"}"#.into(),
                    },
                }]),
            },
            ChatMessage::Tool {
                tool_call_id: "toolu_01".into(),
                content: TextOrParts::Text("12:00Z".into()),
            },
        ]);
        let out = transform_request(body, &ctx(&store));
        assert_eq!(out.messages.len(), 3);
        let assistant = &out.messages[1];
        match &assistant.content.blocks()[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "toolu_01");
                assert_eq!(name, "get_time");
                assert_eq!(input["tz"], "UTC");
            }
            other => panic!("unexpected block: {other:?}"),
        }
        match &out.messages[2].content.blocks()[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                assert_eq!(tool_use_id, "toolu_01");
                match content.as_ref().unwrap() {
                    ToolResultContent::Text(text) => assert_eq!(text, "12:00Z"),
                    other => panic!("unexpected content: {other:?}"),
                }
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn reasoning_content_leads_as_a_thinking_block() {
        let store = SignatureStore::new();
        store.store("sess", &"z".repeat(64));
        let body = base_body(vec![ChatMessage::Assistant {
            content: Some(TextOrParts::Text("answer".into())),
            reasoning_content: Some("because".into()),
            tool_calls: None,
        }]);
        let out = transform_request(body, &ctx(&store));
        let blocks = out.messages[0].content.blocks();
        assert!(matches!(&blocks[0], ContentBlock::Thinking { signature: Some(s), .. } if s.len() == 64));
        assert!(matches!(&blocks[1], ContentBlock::Text { text } if text == "answer"));
    }

    #[test]
    fn thinking_config_tracks_the_target_model() {
        let store = SignatureStore::new();
        let body = base_body(vec![ChatMessage::User {
            content: TextOrParts::Text("hi".into()),
        }]);
        let out = transform_request(body, &ctx(&store));
        assert!(matches!(
            out.thinking,
            Some(ThinkingConfig::Enabled { .. })
        ));

        let body = base_body(vec![ChatMessage::User {
            content: TextOrParts::Text("hi".into()),
        }]);
        let ctx = RequestContext {
            target_model: "gpt-4o-mini",
            session: "sess",
            store: &store,
            stream: false,
        };
        let out = transform_request(body, &ctx);
        assert!(out.thinking.is_none());
    }
}
