use anyproxy_protocol::gemini::{
    Candidate, Content, ContentRole, FinishReason as GeminiFinishReason,
    FunctionCall as GeminiFunctionCall, GenerateContentResponse, Part, UsageMetadata,
};
use anyproxy_protocol::openai::{ChatCompletionResponse, FinishReason};

use crate::helpers::parse_tool_arguments;
use crate::types::ResponseContext;

/// Convert an OpenAI chat-completion response into a Gemini
/// generateContent response.
pub fn transform_response(
    resp: ChatCompletionResponse,
    ctx: &ResponseContext,
) -> GenerateContentResponse {
    let mut parts = Vec::new();
    let mut finish_reason = None;

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
            parts.push(Part::thought(reasoning, signature));
        }
        if let Some(content) = message.content.filter(|text| !text.is_empty()) {
            parts.push(Part::text(content));
        }
        for call in message.tool_calls.unwrap_or_default() {
            parts.push(Part {
                function_call: Some(GeminiFunctionCall {
                    name: call.function.name,
                    args: Some(parse_tool_arguments(&call.function.arguments)),
                    id: Some(call.id),
                }),
                ..Default::default()
            });
        }

        finish_reason = choice.finish_reason.map(map_finish_reason);
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
            finish_reason,
            index: Some(0),
        }],
        usage_metadata: resp.usage.map(|usage| UsageMetadata {
            prompt_token_count: Some(usage.prompt_tokens),
            candidates_token_count: Some(usage.completion_tokens),
            total_token_count: Some(usage.total_tokens),
            thoughts_token_count: None,
        }),
        model_version: Some(ctx.client_model.to_string()),
        response_id: Some(resp.id),
    }
}

fn map_finish_reason(reason: FinishReason) -> GeminiFinishReason {
    match reason {
        FinishReason::Stop | FinishReason::ToolCalls => GeminiFinishReason::Stop,
        FinishReason::Length => GeminiFinishReason::MaxTokens,
        FinishReason::ContentFilter => GeminiFinishReason::Safety,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureStore;
    use anyproxy_protocol::openai::{
        AssistantMessage, ChatChoice, CompletionUsage, FunctionCall, ResponseRole, ToolCall,
        ToolCallKind, CHAT_COMPLETION_OBJECT,
    };

    #[test]
    fn tool_calls_become_function_call_parts() {
        let store = SignatureStore::new();
        let ctx = ResponseContext {
            client_model: "gemini-2.5-pro",
            session: "s",
            store: &store,
        };
        let resp = ChatCompletionResponse {
            id: "chatcmpl-1".into(),
            object: CHAT_COMPLETION_OBJECT.into(),
            created: 1,
            model: "gpt-4o".into(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: ResponseRole::Assistant,
                    content: None,
                    reasoning_content: None,
                    signature: None,
                    tool_calls: Some(vec![ToolCall {
                        id: "call_1".into(),
                        kind: ToolCallKind::Function,
                        function: FunctionCall {
                            name: "get_time".into(),
                            arguments: r#"{"tz":"UTC"}"#.into(),
                        },
                    }]),
                },
                finish_reason: Some(FinishReason::ToolCalls),
            }],
            usage: Some(CompletionUsage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            }),
        };
        let out = transform_response(resp, &ctx);
        let candidate = &out.candidates[0];
        let call = candidate.content.as_ref().unwrap().parts[0]
            .function_call
            .as_ref()
            .unwrap();
        assert_eq!(call.name, "get_time");
        assert_eq!(call.args.as_ref().unwrap()["tz"], "UTC");
        assert_eq!(candidate.finish_reason, Some(GeminiFinishReason::Stop));
        assert_eq!(
            out.usage_metadata.unwrap().total_token_count,
            Some(5)
        );
    }
}
