use anyproxy_protocol::gemini::{
    FinishReason as GeminiFinishReason, GenerateContentResponse,
};
use anyproxy_protocol::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, CompletionUsage, FinishReason,
    FunctionCallChunk, ResponseRole, ToolCallChunk, ToolCallKind, CHAT_COMPLETION_CHUNK_OBJECT,
};

use crate::helpers::{arguments_string, now_unix, synth_call_id, synth_message_id};
use crate::types::{StreamContext, UsageTotals};

/// Re-emits a Gemini streaming response as OpenAI chat-completion chunks.
pub struct GeminiToOpenAIStreamState {
    ctx: StreamContext,
    id: String,
    created: i64,
    role_sent: bool,
    finish_emitted: bool,
    saw_tool_call: bool,
    next_tool_index: u32,
    usage: UsageTotals,
}

impl GeminiToOpenAIStreamState {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            id: synth_message_id("chatcmpl"),
            created: now_unix(),
            role_sent: false,
            finish_emitted: false,
            saw_tool_call: false,
            next_tool_index: 0,
            usage: UsageTotals::default(),
        }
    }

    pub fn transform_chunk(&mut self, chunk: GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        if let Some(response_id) = &chunk.response_id {
            if !response_id.is_empty() {
                self.id = response_id.clone();
            }
        }
        if let Some(usage) = &chunk.usage_metadata {
            self.usage.merge(UsageTotals {
                input_tokens: usage.prompt_token_count.unwrap_or(0),
                output_tokens: usage.candidates_token_count.unwrap_or(0),
            });
        }

        let mut out = Vec::new();
        if !self.role_sent {
            self.role_sent = true;
            out.push(self.chunk(
                ChunkDelta {
                    role: Some(ResponseRole::Assistant),
                    ..Default::default()
                },
                None,
                None,
            ));
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return out;
        };

        if let Some(content) = candidate.content {
            for part in content.parts {
                if let Some(call) = part.function_call {
                    self.saw_tool_call = true;
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    out.push(self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallChunk {
                                index: tool_index,
                                id: Some(
                                    call.id.unwrap_or_else(|| synth_call_id(&call.name)),
                                ),
                                kind: Some(ToolCallKind::Function),
                                function: Some(FunctionCallChunk {
                                    arguments: Some(
                                        call.args
                                            .as_ref()
                                            .map(arguments_string)
                                            .unwrap_or_else(|| "{}".to_string()),
                                    ),
                                    name: Some(call.name),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                        None,
                    ));
                    continue;
                }

                let thought = part.thought.unwrap_or(false);
                if let Some(signature) = part.thought_signature.as_deref() {
                    self.ctx.store.store(&self.ctx.session, signature);
                }
                if let Some(text) = part.text {
                    if text.is_empty() {
                        continue;
                    }
                    let delta = if thought {
                        ChunkDelta {
                            reasoning_content: Some(text),
                            signature: part.thought_signature.clone(),
                            ..Default::default()
                        }
                    } else {
                        ChunkDelta {
                            content: Some(text),
                            ..Default::default()
                        }
                    };
                    out.push(self.chunk(delta, None, None));
                }
            }
        }

        if let Some(reason) = candidate.finish_reason {
            self.finish_emitted = true;
            let finish = map_finish_reason(reason, self.saw_tool_call);
            out.push(self.chunk(
                ChunkDelta::default(),
                Some(finish),
                Some(self.completion_usage()),
            ));
        }

        out
    }

    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finish_emitted || !self.role_sent {
            return Vec::new();
        }
        self.finish_emitted = true;
        let finish = if self.saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        vec![self.chunk(ChunkDelta::default(), Some(finish), Some(self.completion_usage()))]
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    fn completion_usage(&self) -> CompletionUsage {
        CompletionUsage {
            prompt_tokens: self.usage.input_tokens,
            completion_tokens: self.usage.output_tokens,
            total_tokens: self.usage.total(),
        }
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish: Option<FinishReason>,
        usage: Option<CompletionUsage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.ctx.client_model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            usage,
        }
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
    use anyproxy_protocol::gemini::{Candidate, Content, ContentRole, Part, UsageMetadata};
    use std::sync::Arc;

    fn ctx() -> StreamContext {
        StreamContext {
            client_model: "visible".into(),
            session: "s".into(),
            store: Arc::new(SignatureStore::new()),
        }
    }

    fn chunk(parts: Vec<Part>, finish: Option<GeminiFinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts,
                }),
                finish_reason: finish,
                index: Some(0),
            }],
            usage_metadata: finish.map(|_| UsageMetadata {
                prompt_token_count: Some(5),
                candidates_token_count: Some(3),
                total_token_count: Some(8),
                thoughts_token_count: None,
            }),
            model_version: None,
            response_id: Some("resp_9".into()),
        }
    }

    #[test]
    fn text_and_finish_map_to_openai_chunks() {
        let mut state = GeminiToOpenAIStreamState::new(ctx());
        let mut chunks = state.transform_chunk(chunk(vec![Part::text("hel")], None));
        chunks.extend(state.transform_chunk(chunk(
            vec![Part::text("lo")],
            Some(GeminiFinishReason::Stop),
        )));

        assert_eq!(chunks[0].choices[0].delta.role, Some(ResponseRole::Assistant));
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("hel"));
        let last = chunks.last().unwrap();
        assert_eq!(last.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(last.usage.as_ref().unwrap().prompt_tokens, 5);
        assert_eq!(last.id, "resp_9");
        assert!(state.finish().is_empty());
    }

    #[test]
    fn thought_parts_stream_as_reasoning_with_signature_capture() {
        let context = ctx();
        let store = context.store.clone();
        let mut state = GeminiToOpenAIStreamState::new(context);
        let sig = "g".repeat(80);
        let chunks =
            state.transform_chunk(chunk(vec![Part::thought("why", Some(sig.clone()))], None));
        let delta = &chunks[1].choices[0].delta;
        assert_eq!(delta.reasoning_content.as_deref(), Some("why"));
        assert_eq!(delta.signature.as_deref(), Some(sig.as_str()));
        assert_eq!(store.get("s").unwrap(), sig);
    }

    #[test]
    fn function_calls_finish_as_tool_calls() {
        let mut state = GeminiToOpenAIStreamState::new(ctx());
        state.transform_chunk(chunk(
            vec![Part {
                function_call: Some(anyproxy_protocol::gemini::FunctionCall {
                    name: "f".into(),
                    args: None,
                    id: None,
                }),
                ..Default::default()
            }],
            None,
        ));
        let chunks = state.finish();
        assert_eq!(
            chunks[0].choices[0].finish_reason,
            Some(FinishReason::ToolCalls)
        );
    }
}
