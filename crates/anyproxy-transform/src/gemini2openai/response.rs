use anyproxy_protocol::gemini::{
    Content, FinishReason as GeminiFinishReason, GenerateContentResponse,
};
use anyproxy_protocol::openai::{
    AssistantMessage, ChatChoice, ChatCompletionResponse, CompletionUsage, FinishReason,
    FunctionCall, ResponseRole, ToolCall, ToolCallKind, CHAT_COMPLETION_OBJECT,
};

use crate::helpers::{arguments_string, now_unix, synth_call_id, synth_message_id};
use crate::types::ResponseContext;

/// Convert a Gemini generateContent response into an OpenAI chat-completion
/// response.
pub fn transform_response(
    resp: GenerateContentResponse,
    ctx: &ResponseContext,
) -> ChatCompletionResponse {
    let mut texts = Vec::new();
    let mut reasoning = Vec::new();
    let mut tool_calls = Vec::new();
    let mut finish_reason = None;

    if let Some(candidate) = resp.candidates.into_iter().next() {
        if let Some(Content { parts, .. }) = candidate.content {
            for part in parts {
                if let Some(call) = part.function_call {
                    tool_calls.push(ToolCall {
                        id: call.id.unwrap_or_else(|| synth_call_id(&call.name)),
                        kind: ToolCallKind::Function,
                        function: FunctionCall {
                            arguments: call
                                .args
                                .as_ref()
                                .map(arguments_string)
                                .unwrap_or_else(|| "{}".to_string()),
                            name: call.name,
                        },
                    });
                    continue;
                }
                let thought = part.thought.unwrap_or(false);
                if let Some(signature) = part.thought_signature.as_deref() {
                    ctx.store.store(ctx.session, signature);
                }
                if let Some(text) = part.text {
                    if text.is_empty() {
                        continue;
                    }
                    if thought {
                        reasoning.push(text);
                    } else {
                        texts.push(text);
                    }
                }
            }
        }
        finish_reason = candidate
            .finish_reason
            .map(|reason| map_finish_reason(reason, !tool_calls.is_empty()));
    }

    ChatCompletionResponse {
        id: resp.response_id.unwrap_or_else(|| synth_message_id("chatcmpl")),
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
        usage: resp.usage_metadata.map(|usage| {
            let prompt = usage.prompt_token_count.unwrap_or(0);
            let completion = usage.candidates_token_count.unwrap_or(0);
            CompletionUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: usage
                    .total_token_count
                    .unwrap_or_else(|| prompt.saturating_add(completion)),
            }
        }),
    }
}

fn map_finish_reason(reason: GeminiFinishReason, has_tool_calls: bool) -> FinishReason {
    match reason {
        GeminiFinishReason::MaxTokens => FinishReason::Length,
        GeminiFinishReason::Safety
        | GeminiFinishReason::Recitation
        | GeminiFinishReason::Blocklist
        | GeminiFinishReason::ProhibitedContent
        | GeminiFinishReason::Spii => FinishReason::ContentFilter,
        _ => {
            if has_tool_calls {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureStore;
    use anyproxy_protocol::gemini::{
        Candidate, ContentRole, FunctionCall as GeminiFunctionCall, Part, UsageMetadata,
    };
    use serde_json::json;

    fn ctx<'a>(store: &'a SignatureStore) -> ResponseContext<'a> {
        ResponseContext {
            client_model: "gpt-visible",
            session: "s",
            store,
        }
    }

    fn response(parts: Vec<Part>, finish: GeminiFinishReason) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts,
                }),
                finish_reason: Some(finish),
                index: Some(0),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: Some(8),
                candidates_token_count: Some(2),
                total_token_count: Some(10),
                thoughts_token_count: None,
            }),
            model_version: Some("models/gemini-2.5-pro".into()),
            response_id: Some("resp_1".into()),
        }
    }

    #[test]
    fn function_calls_become_tool_calls_with_synthesised_ids() {
        let store = SignatureStore::new();
        let out = transform_response(
            response(
                vec![Part {
                    function_call: Some(GeminiFunctionCall {
                        name: "get_time".into(),
                        args: Some(json!({"tz": "UTC"})),
                        id: None,
                    }),
                    ..Default::default()
                }],
                GeminiFinishReason::Stop,
            ),
            &ctx(&store),
        );
        let choice = &out.choices[0];
        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        let call = &choice.message.tool_calls.as_ref().unwrap()[0];
        assert!(call.id.starts_with("call_"));
        assert!(call.id.ends_with("_get_time"));
        assert_eq!(out.usage.as_ref().unwrap().total_tokens, 10);
    }

    #[test]
    fn safety_finish_maps_to_content_filter() {
        let store = SignatureStore::new();
        let out = transform_response(
            response(vec![Part::text("redacted")], GeminiFinishReason::Safety),
            &ctx(&store),
        );
        assert_eq!(
            out.choices[0].finish_reason,
            Some(FinishReason::ContentFilter)
        );
    }

    #[test]
    fn thought_parts_surface_as_reasoning_and_store_signatures() {
        let store = SignatureStore::new();
        let sig = "v".repeat(64);
        let out = transform_response(
            response(
                vec![
                    Part::thought("hmm", Some(sig.clone())),
                    Part::text("answer"),
                ],
                GeminiFinishReason::Stop,
            ),
            &ctx(&store),
        );
        let message = &out.choices[0].message;
        assert_eq!(message.reasoning_content.as_deref(), Some("hmm"));
        assert_eq!(message.content.as_deref(), Some("answer"));
        assert_eq!(store.get("s").unwrap(), sig);
        assert_eq!(out.model, "gpt-visible");
    }
}
