use anyproxy_protocol::claude::{
    ContentBlock, Message, MessageRole, MessageType, StopReason, Usage,
};
use anyproxy_protocol::openai::{ChatCompletionResponse, FinishReason};

use crate::helpers::{parse_tool_arguments, synth_message_id};
use crate::types::ResponseContext;

/// Convert an OpenAI chat-completion response into an Anthropic message.
pub fn transform_response(resp: ChatCompletionResponse, ctx: &ResponseContext) -> Message {
    let mut blocks = Vec::new();
    let mut stop_reason = None;

    if let Some(choice) = resp.choices.into_iter().next() {
        let message = choice.message;

        if let Some(signature) = message.signature.as_deref() {
            ctx.store.store(ctx.session, signature);
        }

        if let Some(reasoning) = message.reasoning_content.filter(|text| !text.is_empty()) {
            let signature = message
                .signature
                .clone()
                .or_else(|| ctx.store.get(ctx.session));
            blocks.push(ContentBlock::Thinking {
                thinking: reasoning,
                signature,
            });
        }

        if let Some(content) = message.content.filter(|text| !text.is_empty()) {
            blocks.push(ContentBlock::text(content));
        }

        for call in message.tool_calls.unwrap_or_default() {
            blocks.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: parse_tool_arguments(&call.function.arguments),
            });
        }

        stop_reason = choice.finish_reason.map(map_finish_reason);
    }

    if blocks.is_empty() {
        blocks.push(ContentBlock::text(""));
    }

    let usage = resp
        .usage
        .map(|usage| Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
        .unwrap_or_default();

    Message {
        id: if resp.id.is_empty() {
            synth_message_id("msg")
        } else {
            resp.id
        },
        kind: MessageType::Message,
        role: MessageRole::Assistant,
        content: blocks,
        model: ctx.client_model.to_string(),
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::Refusal,
    }
}
