use serde_json::json;

use anyproxy_protocol::claude::{
    ContentBlock, Message, MessageRole, MessageType, StopReason, Usage,
};
use anyproxy_protocol::gemini::{
    Content, FinishReason as GeminiFinishReason, GenerateContentResponse,
};

use crate::helpers::{synth_call_id, synth_message_id};
use crate::types::ResponseContext;

/// Convert a Gemini generateContent response into an Anthropic message.
/// Thinking leads the turn regardless of how the upstream interleaved parts.
pub fn transform_response(resp: GenerateContentResponse, ctx: &ResponseContext) -> Message {
    let mut thinking_blocks = Vec::new();
    let mut text_blocks = Vec::new();
    let mut tool_blocks = Vec::new();
    let mut finish_reason = None;

    if let Some(candidate) = resp.candidates.into_iter().next() {
        if let Some(Content { parts, .. }) = candidate.content {
            for part in parts {
                if let Some(call) = part.function_call {
                    tool_blocks.push(ContentBlock::ToolUse {
                        id: call.id.unwrap_or_else(|| synth_call_id(&call.name)),
                        name: call.name,
                        input: call.args.unwrap_or_else(|| json!({})),
                    });
                    continue;
                }
                let thought = part.thought.unwrap_or(false);
                if let Some(signature) = part.thought_signature.as_deref() {
                    ctx.store.store(ctx.session, signature);
                }
                if let Some(text) = part.text {
                    if thought {
                        let signature = part
                            .thought_signature
                            .or_else(|| ctx.store.get(ctx.session));
                        thinking_blocks.push(ContentBlock::Thinking {
                            thinking: text,
                            signature,
                        });
                    } else if !text.is_empty() {
                        text_blocks.push(ContentBlock::text(text));
                    }
                }
            }
        }
        finish_reason = candidate.finish_reason;
    }

    let has_tool_use = !tool_blocks.is_empty();
    let mut blocks = thinking_blocks;
    blocks.extend(text_blocks);
    blocks.extend(tool_blocks);
    if blocks.is_empty() {
        blocks.push(ContentBlock::text(""));
    }

    let usage = resp
        .usage_metadata
        .map(|usage| Usage {
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    Message {
        id: resp
            .response_id
            .unwrap_or_else(|| synth_message_id("msg_gemini")),
        kind: MessageType::Message,
        role: MessageRole::Assistant,
        content: blocks,
        model: ctx.client_model.to_string(),
        stop_reason: Some(map_finish_reason(
            finish_reason.unwrap_or(GeminiFinishReason::Stop),
            has_tool_use,
        )),
        stop_sequence: None,
        usage,
    }
}

fn map_finish_reason(reason: GeminiFinishReason, has_tool_use: bool) -> StopReason {
    match reason {
        GeminiFinishReason::MaxTokens => StopReason::MaxTokens,
        GeminiFinishReason::Safety
        | GeminiFinishReason::Recitation
        | GeminiFinishReason::Blocklist
        | GeminiFinishReason::ProhibitedContent
        | GeminiFinishReason::Spii => StopReason::Refusal,
        _ => {
            if has_tool_use {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            }
        }
    }
}
