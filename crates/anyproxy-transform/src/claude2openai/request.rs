use anyproxy_protocol::claude::{
    ContentBlock, CreateMessageRequestBody, ImageSource, MessageContent, MessageParam,
    MessageRole, ThinkingConfig, ToolChoice as ClaudeToolChoice,
};
use anyproxy_protocol::openai::{
    ChatCompletionRequestBody, ChatMessage, ContentPart, FunctionDefinition, ImageUrl,
    NamedFunction, NamedToolChoice, StopSequences, TextOrParts, ToolCall, ToolCallKind,
    ToolChoice, ToolDefinition, FunctionCall,
};

use crate::helpers::{arguments_string, materialize_tool_result};
use crate::thinking;
use crate::types::RequestContext;

/// Convert an Anthropic create-message request into an OpenAI
/// chat-completions request.
pub fn transform_request(
    body: CreateMessageRequestBody,
    ctx: &RequestContext,
) -> ChatCompletionRequestBody {
    let client_requested_thinking = matches!(body.thinking, Some(ThinkingConfig::Enabled { .. }));
    let history_compatible = thinking::claude_history_compatible(&body.messages);

    let mut messages = Vec::new();
    if let Some(system) = &body.system {
        let text = system.joined_text();
        if !text.is_empty() {
            messages.push(ChatMessage::System {
                content: TextOrParts::Text(text),
            });
        }
    }

    for message in &body.messages {
        match message.role {
            MessageRole::User => map_user_message(&message.content, &mut messages),
            MessageRole::Assistant => {
                messages.push(map_assistant_message(&message.content, ctx))
            }
        }
    }

    let tools = body.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| ToolDefinition {
                kind: ToolCallKind::Function,
                function: FunctionDefinition {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(tool.input_schema.clone()),
                    strict: None,
                },
            })
            .collect::<Vec<_>>()
    });

    let reasoning_effort = if client_requested_thinking
        && thinking::resolve_thinking(true, ctx.target_model, history_compatible)
    {
        Some("medium".to_string())
    } else {
        None
    };

    let mut out = ChatCompletionRequestBody {
        model: ctx.target_model.to_string(),
        messages,
        tools,
        tool_choice: body.tool_choice.map(map_tool_choice),
        temperature: body.temperature,
        top_p: body.top_p,
        max_tokens: (body.max_tokens > 0).then_some(body.max_tokens),
        max_completion_tokens: None,
        stop: body
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

fn map_user_message(content: &MessageContent, messages: &mut Vec<ChatMessage>) {
    match content {
        MessageContent::Text(text) => messages.push(ChatMessage::User {
            content: TextOrParts::Text(text.clone()),
        }),
        MessageContent::Blocks(blocks) => {
            let mut parts = Vec::new();
            // Tool results precede any residual user text, matching the order
            // the upstream produced them in.
            for block in blocks {
                if let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } = block
                {
                    messages.push(ChatMessage::Tool {
                        tool_call_id: tool_use_id.clone(),
                        content: TextOrParts::Text(materialize_tool_result(content.as_ref())),
                    });
                }
            }
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            parts.push(ContentPart::Text { text: text.clone() });
                        }
                    }
                    ContentBlock::Image { source } => parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_url_of(source),
                        },
                    }),
                    _ => {}
                }
            }
            if parts.is_empty() {
                return;
            }
            let content = match parts.as_slice() {
                [ContentPart::Text { text }] => TextOrParts::Text(text.clone()),
                _ => TextOrParts::Parts(parts),
            };
            messages.push(ChatMessage::User { content });
        }
    }
}

fn map_assistant_message(content: &MessageContent, ctx: &RequestContext) -> ChatMessage {
    let mut texts = Vec::new();
    let mut reasoning = Vec::new();
    let mut tool_calls = Vec::new();

    match content {
        MessageContent::Text(text) => texts.push(text.clone()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            texts.push(text.clone());
                        }
                    }
                    ContentBlock::Thinking {
                        thinking,
                        signature,
                    } => {
                        if !thinking.is_empty() {
                            reasoning.push(thinking.clone());
                        }
                        if let Some(signature) = signature.as_deref() {
                            ctx.store.store(ctx.session, signature);
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(ToolCall {
                            id: id.clone(),
                            kind: ToolCallKind::Function,
                            function: FunctionCall {
                                name: name.clone(),
                                arguments: arguments_string(input),
                            },
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    ChatMessage::Assistant {
        content: (!texts.is_empty()).then(|| TextOrParts::Text(texts.join("\n"))),
        reasoning_content: (!reasoning.is_empty()).then(|| reasoning.join("\n")),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
    }
}

fn map_tool_choice(choice: ClaudeToolChoice) -> ToolChoice {
    match choice {
        ClaudeToolChoice::Auto => ToolChoice::Mode("auto".to_string()),
        ClaudeToolChoice::Any => ToolChoice::Mode("required".to_string()),
        ClaudeToolChoice::None => ToolChoice::Mode("none".to_string()),
        ClaudeToolChoice::Tool { name } => ToolChoice::Named(NamedToolChoice {
            kind: ToolCallKind::Function,
            function: NamedFunction { name },
        }),
    }
}

fn image_url_of(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
        ImageSource::Url { url } => url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureStore;
    use anyproxy_protocol::claude::{SystemPrompt, ToolResultContent};
    use serde_json::json;

    fn ctx<'a>(store: &'a SignatureStore) -> RequestContext<'a> {
        RequestContext {
            target_model: "gpt-4o-mini",
            session: "sess",
            store,
            stream: false,
        }
    }

    fn base_body(messages: Vec<MessageParam>) -> CreateMessageRequestBody {
        CreateMessageRequestBody {
            model: "claude-3-5-sonnet".into(),
            messages,
            max_tokens: 16,
            system: None,
            temperature: None,
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
    fn system_dehoists_to_the_first_message() {
        let store = SignatureStore::new();
        let mut body = base_body(vec![MessageParam {
            role: MessageRole::User,
            content: MessageContent::Text("ping".into()),
        }]);
        body.system = Some(SystemPrompt::Text("be terse".into()));
        let out = transform_request(body, &ctx(&store));
        assert!(matches!(&out.messages[0], ChatMessage::System { .. }));
        assert_eq!(out.model, "gpt-4o-mini");
        assert_eq!(out.max_tokens, Some(16));
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let store = SignatureStore::new();
        let body = base_body(vec![MessageParam {
            role: MessageRole::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::ToolResult {
                    tool_use_id: "toolu_01".into(),
                    content: Some(ToolResultContent::Text("12:00Z".into())),
                    is_error: None,
                },
                ContentBlock::text("next question"),
            ]),
        }]);
        let out = transform_request(body, &ctx(&store));
        match &out.messages[0] {
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "toolu_01");
                assert_eq!(content.joined_text(), "12:00Z");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(matches!(&out.messages[1], ChatMessage::User { .. }));
    }

    #[test]
    fn thinking_blocks_fold_into_reasoning_and_store_signatures() {
        let store = SignatureStore::new();
        let sig = "p".repeat(88);
        let body = base_body(vec![MessageParam {
            role: MessageRole::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::Thinking {
                    thinking: "step one".into(),
                    signature: Some(sig.clone()),
                },
                ContentBlock::text("result"),
                ContentBlock::ToolUse {
                    id: "toolu_9".into(),
                    name: "f".into(),
                    input: json!({"a": 1}),
                },
            ]),
        }]);
        let out = transform_request(body, &ctx(&store));
        match &out.messages[0] {
            ChatMessage::Assistant {
                content,
                reasoning_content,
                tool_calls,
            } => {
                assert_eq!(content.as_ref().unwrap().joined_text(), "result");
                assert_eq!(reasoning_content.as_deref(), Some("step one"));
                assert_eq!(tool_calls.as_ref().unwrap()[0].id, "toolu_9");
                assert_eq!(
                    tool_calls.as_ref().unwrap()[0].function.arguments,
                    r#"{"a":1}"#
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(store.get("sess").unwrap(), sig);
    }

    #[test]
    fn streaming_requests_include_usage_accounting() {
        let store = SignatureStore::new();
        let body = base_body(vec![MessageParam {
            role: MessageRole::User,
            content: MessageContent::Text("hi".into()),
        }]);
        let ctx = RequestContext {
            target_model: "gpt-4o-mini",
            session: "sess",
            store: &store,
            stream: true,
        };
        let out = transform_request(body, &ctx);
        assert_eq!(out.stream, Some(true));
        assert_eq!(
            out.stream_options.unwrap().include_usage,
            Some(true)
        );
    }

    #[test]
    fn tool_choice_maps_across() {
        let store = SignatureStore::new();
        let mut body = base_body(vec![MessageParam {
            role: MessageRole::User,
            content: MessageContent::Text("hi".into()),
        }]);
        body.tool_choice = Some(ClaudeToolChoice::Any);
        let out = transform_request(body, &ctx(&store));
        match out.tool_choice.unwrap() {
            ToolChoice::Mode(mode) => assert_eq!(mode, "required"),
            other => panic!("unexpected choice: {other:?}"),
        }
    }
}
