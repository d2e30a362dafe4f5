use std::collections::BTreeMap;

use anyproxy_protocol::claude::{BlockDelta, ContentBlock, StopReason, StreamEvent};
use anyproxy_protocol::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, CompletionUsage, FinishReason,
    FunctionCallChunk, ResponseRole, ToolCallChunk, ToolCallKind, CHAT_COMPLETION_CHUNK_OBJECT,
};

use crate::helpers::now_unix;
use crate::types::{StreamContext, UsageTotals};

/// Re-emits an Anthropic SSE event stream as OpenAI chat-completion chunks.
pub struct ClaudeToOpenAIStreamState {
    ctx: StreamContext,
    id: String,
    created: i64,
    role_sent: bool,
    finish_emitted: bool,
    pending_finish: Option<FinishReason>,
    tool_indices: BTreeMap<u32, u32>,
    usage: UsageTotals,
}

impl ClaudeToOpenAIStreamState {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            id: "unknown".to_string(),
            created: now_unix(),
            role_sent: false,
            finish_emitted: false,
            pending_finish: None,
            tool_indices: BTreeMap::new(),
            usage: UsageTotals::default(),
        }
    }

    pub fn transform_event(&mut self, event: StreamEvent) -> Vec<ChatCompletionChunk> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.usage.merge(UsageTotals {
                    input_tokens: message.usage.input_tokens,
                    output_tokens: message.usage.output_tokens,
                });
                self.role_sent = true;
                vec![self.chunk(
                    ChunkDelta {
                        role: Some(ResponseRole::Assistant),
                        ..Default::default()
                    },
                    None,
                    None,
                )]
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.tool_indices.len() as u32;
                    self.tool_indices.insert(index, tool_index);
                    vec![self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallChunk {
                                index: tool_index,
                                id: Some(id),
                                kind: Some(ToolCallKind::Function),
                                function: Some(FunctionCallChunk {
                                    name: Some(name),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                        None,
                    )]
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![self.chunk(
                    ChunkDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                    None,
                )],
                BlockDelta::ThinkingDelta { thinking } => vec![self.chunk(
                    ChunkDelta {
                        reasoning_content: Some(thinking),
                        ..Default::default()
                    },
                    None,
                    None,
                )],
                BlockDelta::SignatureDelta { signature } => {
                    self.ctx.store.store(&self.ctx.session, &signature);
                    Vec::new()
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    let Some(tool_index) = self.tool_indices.get(&index).copied() else {
                        return Vec::new();
                    };
                    vec![self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallChunk {
                                index: tool_index,
                                id: None,
                                kind: None,
                                function: Some(FunctionCallChunk {
                                    name: None,
                                    arguments: Some(partial_json),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                        None,
                    )]
                }
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.usage.merge(UsageTotals {
                        input_tokens: usage.input_tokens.unwrap_or(0),
                        output_tokens: usage.output_tokens.unwrap_or(0),
                    });
                }
                match delta.stop_reason {
                    Some(reason) => {
                        self.finish_emitted = true;
                        let finish = map_stop_reason(reason);
                        vec![self.chunk(
                            ChunkDelta::default(),
                            Some(finish),
                            Some(self.completion_usage()),
                        )]
                    }
                    None => Vec::new(),
                }
            }
            StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Error { .. } => Vec::new(),
        }
    }

    /// The `[DONE]` sentinel is the pipeline's job; this only closes an
    /// unfinished message when the upstream ended without a `message_delta`.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finish_emitted || !self.role_sent {
            return Vec::new();
        }
        self.finish_emitted = true;
        vec![self.chunk(
            ChunkDelta::default(),
            Some(self.pending_finish.unwrap_or(FinishReason::Stop)),
            Some(self.completion_usage()),
        )]
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

fn map_stop_reason(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
        StopReason::Refusal => FinishReason::ContentFilter,
    }
}
