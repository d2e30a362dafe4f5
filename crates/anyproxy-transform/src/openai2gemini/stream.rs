use std::collections::BTreeMap;

use anyproxy_protocol::gemini::{
    Candidate, Content, ContentRole, FinishReason as GeminiFinishReason,
    FunctionCall as GeminiFunctionCall, GenerateContentResponse, Part, UsageMetadata,
};
use anyproxy_protocol::openai::{ChatCompletionChunk, FinishReason};

use crate::helpers::{parse_tool_arguments, synth_message_id};
use crate::types::{StreamContext, UsageTotals};

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Re-emits an OpenAI chunk stream as Gemini streaming responses. Tool-call
/// argument fragments are buffered until the stream finishes; Gemini carries
/// complete `functionCall` parts, never partial JSON.
pub struct OpenAIToGeminiStreamState {
    ctx: StreamContext,
    response_id: String,
    pending_calls: BTreeMap<u32, PendingCall>,
    finish: Option<GeminiFinishReason>,
    finish_emitted: bool,
    usage: UsageTotals,
}

impl OpenAIToGeminiStreamState {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            response_id: synth_message_id("response"),
            pending_calls: BTreeMap::new(),
            finish: None,
            finish_emitted: false,
            usage: UsageTotals::default(),
        }
    }

    pub fn transform_chunk(&mut self, chunk: ChatCompletionChunk) -> Vec<GenerateContentResponse> {
        if !chunk.id.is_empty() {
            self.response_id = chunk.id.clone();
        }

        let mut out = Vec::new();

        if let Some(choice) = chunk.choices.first() {
            if let Some(signature) = choice.delta.signature.as_deref() {
                self.ctx.store.store(&self.ctx.session, signature);
            }
            if let Some(reasoning) = choice.delta.reasoning_content.as_deref() {
                if !reasoning.is_empty() {
                    let signature = choice.delta.signature.clone();
                    out.push(self.content_chunk(vec![Part::thought(reasoning, signature)]));
                }
            }
            if let Some(content) = choice.delta.content.as_deref() {
                if !content.is_empty() {
                    out.push(self.content_chunk(vec![Part::text(content)]));
                }
            }
            if let Some(calls) = &choice.delta.tool_calls {
                for call in calls {
                    let pending = self.pending_calls.entry(call.index).or_default();
                    if let Some(id) = &call.id {
                        pending.id = Some(id.clone());
                    }
                    if let Some(function) = &call.function {
                        if let Some(name) = &function.name {
                            pending.name = name.clone();
                        }
                        if let Some(arguments) = &function.arguments {
                            pending.arguments.push_str(arguments);
                        }
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish = Some(map_finish_reason(reason));
                let calls = self.flush_calls();
                if !calls.is_empty() {
                    out.push(self.content_chunk(calls));
                }
            }
        }

        if let Some(usage) = &chunk.usage {
            self.usage.merge(UsageTotals {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }

        out
    }

    /// Emits the trailing chunk carrying the finish reason and usage totals.
    pub fn finish(&mut self) -> Vec<GenerateContentResponse> {
        if self.finish_emitted {
            return Vec::new();
        }
        self.finish_emitted = true;

        let mut out = Vec::new();
        let calls = self.flush_calls();
        if !calls.is_empty() {
            out.push(self.content_chunk(calls));
        }

        let finish_reason = self.finish.take().unwrap_or(GeminiFinishReason::Stop);
        out.push(GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts: Vec::new(),
                }),
                finish_reason: Some(finish_reason),
                index: Some(0),
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: Some(self.usage.input_tokens),
                candidates_token_count: Some(self.usage.output_tokens),
                total_token_count: Some(self.usage.total()),
                thoughts_token_count: None,
            }),
            model_version: Some(self.ctx.client_model.clone()),
            response_id: Some(self.response_id.clone()),
        });
        out
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    fn flush_calls(&mut self) -> Vec<Part> {
        std::mem::take(&mut self.pending_calls)
            .into_values()
            .map(|call| {
                let args = if call.arguments.is_empty() {
                    serde_json::json!({})
                } else {
                    parse_tool_arguments(&call.arguments)
                };
                Part {
                    function_call: Some(GeminiFunctionCall {
                        args: Some(args),
                        id: call.id,
                        name: call.name,
                    }),
                    ..Default::default()
                }
            })
            .collect()
    }

    fn content_chunk(&self, parts: Vec<Part>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts,
                }),
                finish_reason: None,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: Some(self.ctx.client_model.clone()),
            response_id: Some(self.response_id.clone()),
        }
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
        ChunkChoice, ChunkDelta, CompletionUsage, FunctionCallChunk, ToolCallChunk, ToolCallKind,
        CHAT_COMPLETION_CHUNK_OBJECT,
    };
    use std::sync::Arc;

    fn ctx() -> StreamContext {
        StreamContext {
            client_model: "gemini-2.5-flash".into(),
            session: "s".into(),
            store: Arc::new(SignatureStore::new()),
        }
    }

    fn chunk(delta: ChunkDelta, finish: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "chatcmpl-1".into(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.into(),
            created: 1,
            model: "m".into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            usage: None,
        }
    }

    #[test]
    fn buffered_tool_arguments_flush_as_one_function_call() {
        let mut state = OpenAIToGeminiStreamState::new(ctx());
        state.transform_chunk(chunk(
            ChunkDelta {
                tool_calls: Some(vec![ToolCallChunk {
                    index: 0,
                    id: Some("call_1".into()),
                    kind: Some(ToolCallKind::Function),
                    function: Some(FunctionCallChunk {
                        name: Some("get_time".into()),
                        arguments: Some("{\"tz\":".into()),
                    }),
                }]),
                ..Default::default()
            },
            None,
        ));
        let out = state.transform_chunk(chunk(
            ChunkDelta {
                tool_calls: Some(vec![ToolCallChunk {
                    index: 0,
                    id: None,
                    kind: None,
                    function: Some(FunctionCallChunk {
                        name: None,
                        arguments: Some("\"UTC\"}".into()),
                    }),
                }]),
                ..Default::default()
            },
            Some(FinishReason::ToolCalls),
        ));
        let call = out[0].candidates[0].content.as_ref().unwrap().parts[0]
            .function_call
            .as_ref()
            .unwrap();
        assert_eq!(call.name, "get_time");
        assert_eq!(call.args.as_ref().unwrap()["tz"], "UTC");
        assert_eq!(call.id.as_deref(), Some("call_1"));
    }

    #[test]
    fn finish_carries_usage_metadata() {
        let mut state = OpenAIToGeminiStreamState::new(ctx());
        state.transform_chunk(chunk(
            ChunkDelta {
                content: Some("hi".into()),
                ..Default::default()
            },
            Some(FinishReason::Stop),
        ));
        state.transform_chunk(ChatCompletionChunk {
            id: "chatcmpl-1".into(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.into(),
            created: 1,
            model: "m".into(),
            choices: Vec::new(),
            usage: Some(CompletionUsage {
                prompt_tokens: 10,
                completion_tokens: 4,
                total_tokens: 14,
            }),
        });
        let out = state.finish();
        let last = out.last().unwrap();
        assert_eq!(
            last.candidates[0].finish_reason,
            Some(GeminiFinishReason::Stop)
        );
        assert_eq!(
            last.usage_metadata.as_ref().unwrap().total_token_count,
            Some(14)
        );
    }
}
