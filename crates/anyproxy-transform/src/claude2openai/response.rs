use anyproxy_protocol::claude::{ContentBlock, Message, StopReason};
use anyproxy_protocol::openai::{
    AssistantMessage, ChatChoice, ChatCompletionResponse, CompletionUsage, FinishReason,
    FunctionCall, ResponseRole, ToolCall, ToolCallKind, CHAT_COMPLETION_OBJECT,
};

use crate::helpers::{arguments_string, now_unix};
use crate::types::ResponseContext;

/// Convert an Anthropic message into an OpenAI chat-completion response.
pub fn transform_response(resp: Message, ctx: &ResponseContext) -> ChatCompletionResponse {
    let mut texts = Vec::new();
    let mut reasoning = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &resp.content {
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
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: ToolCallKind::Function,
                function: FunctionCall {
                    name: name.clone(),
                    arguments: arguments_string(input),
                },
            }),
            _ => {}
        }
    }

    let finish_reason = resp
        .stop_reason
        .map(map_stop_reason)
        .or_else(|| (!tool_calls.is_empty()).then_some(FinishReason::ToolCalls));

    ChatCompletionResponse {
        id: resp.id,
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: now_unix(),
        model: ctx.client_model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: ResponseRole::Assistant,
                content: (!texts.is_empty()).then(|| texts.join("\n")),
                reasoning_content: (!reasoning.is_empty()).then(|| reasoning.join("\n")),
                signature: None,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason,
        }],
        usage: Some(CompletionUsage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp
                .usage
                .input_tokens
                .saturating_add(resp.usage.output_tokens),
        }),
    }
}

fn map_stop_reason(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
        StopReason::Refusal => FinishReason::ContentFilter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureStore;
    use anyproxy_protocol::claude::{MessageRole, MessageType, Usage};
    use serde_json::json;

    fn message(content: Vec<ContentBlock>, stop: Option<StopReason>) -> Message {
        Message {
            id: "msg_1".into(),
            kind: MessageType::Message,
            role: MessageRole::Assistant,
            content,
            model: "claude-3-5-sonnet".into(),
            stop_reason: stop,
            stop_sequence: None,
            usage: Usage {
                input_tokens: 11,
                output_tokens: 5,
            },
        }
    }

    #[test]
    fn tool_use_round_trips_with_the_original_id() {
        let store = SignatureStore::new();
        let ctx = ResponseContext {
            client_model: "gpt-4o",
            session: "s",
            store: &store,
        };
        let out = transform_response(
            message(
                vec![ContentBlock::ToolUse {
                    id: "toolu_01".into(),
                    name: "get_time".into(),
                    input: json!({"tz": "UTC"}),
                }],
                Some(StopReason::ToolUse),
            ),
            &ctx,
        );
        let choice = &out.choices[0];
        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "toolu_01");
        assert_eq!(calls[0].function.name, "get_time");
        assert_eq!(calls[0].function.arguments, r#"{"tz":"UTC"}"#);
        assert_eq!(out.usage.as_ref().unwrap().total_tokens, 16);
    }

    #[test]
    fn thinking_surfaces_as_reasoning_content() {
        let store = SignatureStore::new();
        let ctx = ResponseContext {
            client_model: "gpt-4o",
            session: "s",
            store: &store,
        };
        let sig = "q".repeat(60);
        let out = transform_response(
            message(
                vec![
                    ContentBlock::Thinking {
                        thinking: "pondering".into(),
                        signature: Some(sig.clone()),
                    },
                    ContentBlock::text("answer"),
                ],
                Some(StopReason::EndTurn),
            ),
            &ctx,
        );
        let message = &out.choices[0].message;
        assert_eq!(message.reasoning_content.as_deref(), Some("pondering"));
        assert_eq!(message.content.as_deref(), Some("answer"));
        assert_eq!(store.get("s").unwrap(), sig);
        assert_eq!(out.model, "gpt-4o");
    }
}
