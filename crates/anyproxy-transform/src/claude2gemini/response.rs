use anyproxy_protocol::claude::{ContentBlock, Message, StopReason};
use anyproxy_protocol::gemini::{
    Candidate, Content, ContentRole, FinishReason as GeminiFinishReason,
    FunctionCall as GeminiFunctionCall, GenerateContentResponse, Part, UsageMetadata,
};

use crate::types::ResponseContext;

/// Convert an Anthropic message into a Gemini generateContent response.
pub fn transform_response(resp: Message, ctx: &ResponseContext) -> GenerateContentResponse {
    let mut parts = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    parts.push(Part::text(text));
                }
            }
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                if let Some(signature) = signature.as_deref() {
                    ctx.store.store(ctx.session, signature);
                }
                parts.push(Part::thought(thinking, signature));
            }
            ContentBlock::ToolUse { id, name, input } => parts.push(Part {
                function_call: Some(GeminiFunctionCall {
                    name,
                    args: input.is_object().then_some(input),
                    id: Some(id),
                }),
                ..Default::default()
            }),
            _ => {}
        }
    }

    if parts.is_empty() {
        parts.push(Part::text(""));
    }

    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content {
                role: Some(ContentRole::Model),
                parts,
            }),
            finish_reason: Some(
                resp.stop_reason
                    .map(map_stop_reason)
                    .unwrap_or(GeminiFinishReason::Stop),
            ),
            index: Some(0),
        }],
        usage_metadata: Some(UsageMetadata {
            prompt_token_count: Some(resp.usage.input_tokens),
            candidates_token_count: Some(resp.usage.output_tokens),
            total_token_count: Some(
                resp.usage
                    .input_tokens
                    .saturating_add(resp.usage.output_tokens),
            ),
            thoughts_token_count: None,
        }),
        model_version: Some(ctx.client_model.to_string()),
        response_id: Some(resp.id),
    }
}

fn map_stop_reason(reason: StopReason) -> GeminiFinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence | StopReason::ToolUse => {
            GeminiFinishReason::Stop
        }
        StopReason::MaxTokens => GeminiFinishReason::MaxTokens,
        StopReason::Refusal => GeminiFinishReason::Safety,
    }
}
