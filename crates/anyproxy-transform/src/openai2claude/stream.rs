use std::collections::BTreeMap;

use serde_json::json;

use anyproxy_protocol::claude::{
    BlockDelta, ContentBlock, DeltaUsage, Message, MessageDelta, MessageRole, MessageType,
    StopReason, StreamEvent, Usage,
};
use anyproxy_protocol::openai::{
    ChatCompletionChunk, FinishReason, ToolCallChunk,
};

use crate::helpers::synth_message_id;
use crate::types::{StreamContext, UsageTotals};

/// Re-emits an OpenAI chunk stream as Anthropic SSE events, tracking block
/// framing so every delta sits between a matching start/stop pair.
pub struct OpenAIToClaudeStreamState {
    ctx: StreamContext,
    message_started: bool,
    finish_emitted: bool,
    pending_finish: Option<StopReason>,
    next_block_index: u32,
    thinking_block: Option<u32>,
    text_block: Option<u32>,
    pending_signature: Option<String>,
    tool_blocks: BTreeMap<u32, u32>,
    usage: UsageTotals,
}

impl OpenAIToClaudeStreamState {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            message_started: false,
            finish_emitted: false,
            pending_finish: None,
            next_block_index: 0,
            thinking_block: None,
            text_block: None,
            pending_signature: None,
            tool_blocks: BTreeMap::new(),
            usage: UsageTotals::default(),
        }
    }

    pub fn transform_chunk(&mut self, chunk: ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if !self.message_started {
            self.message_started = true;
            events.push(self.message_start_event(&chunk.id));
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(signature) = choice.delta.signature.as_deref() {
                self.capture_signature(signature);
            }
            if let Some(reasoning) = choice.delta.reasoning_content.as_deref() {
                self.emit_thinking(reasoning, &mut events);
            }
            if let Some(content) = choice.delta.content.as_deref() {
                self.emit_text(content, &mut events);
            }
            if let Some(tool_calls) = &choice.delta.tool_calls {
                for call in tool_calls {
                    self.emit_tool_call(call, &mut events);
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.close_open_blocks(&mut events);
                self.pending_finish = Some(map_finish_reason(reason));
            }
        }

        if let Some(usage) = &chunk.usage {
            self.usage.merge(UsageTotals {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
            if self.pending_finish.is_some() {
                self.emit_final(&mut events);
            }
        }

        events
    }

    /// Close whatever is still open; called once the upstream stream ends.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.message_started {
            return events;
        }
        if !self.finish_emitted {
            self.close_open_blocks(&mut events);
            self.emit_final(&mut events);
        }
        events
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    fn message_start_event(&self, id: &str) -> StreamEvent {
        StreamEvent::MessageStart {
            message: Message {
                id: if id.is_empty() {
                    synth_message_id("msg")
                } else {
                    id.to_string()
                },
                kind: MessageType::Message,
                role: MessageRole::Assistant,
                content: Vec::new(),
                model: self.ctx.client_model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }
    }

    fn capture_signature(&mut self, signature: &str) {
        if signature.is_empty() {
            return;
        }
        self.ctx.store.store(&self.ctx.session, signature);
        let longer = self
            .pending_signature
            .as_ref()
            .is_none_or(|existing| signature.len() > existing.len());
        if longer {
            self.pending_signature = Some(signature.to_string());
        }
    }

    fn emit_thinking(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.close_text(events);
        let index = match self.thinking_block {
            Some(index) => index,
            None => {
                let index = self.allocate_block();
                self.thinking_block = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                });
                index
            }
        };
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::ThinkingDelta {
                thinking: text.to_string(),
            },
        });
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.close_thinking(events);
        let index = match self.text_block {
            Some(index) => index,
            None => {
                let index = self.allocate_block();
                self.text_block = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::text(""),
                });
                index
            }
        };
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn emit_tool_call(&mut self, call: &ToolCallChunk, events: &mut Vec<StreamEvent>) {
        self.close_thinking(events);
        self.close_text(events);

        let index = match self.tool_blocks.get(&call.index) {
            Some(index) => *index,
            None => {
                let index = self.allocate_block();
                self.tool_blocks.insert(call.index, index);
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolcall-{}", call.index));
                let name = call
                    .function
                    .as_ref()
                    .and_then(|function| function.name.clone())
                    .unwrap_or_else(|| "tool".to_string());
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name,
                        input: json!({}),
                    },
                });
                index
            }
        };

        if let Some(arguments) = call
            .function
            .as_ref()
            .and_then(|function| function.arguments.as_deref())
        {
            if !arguments.is_empty() {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: arguments.to_string(),
                    },
                });
            }
        }
    }

    fn allocate_block(&mut self) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    /// Buffered signatures flush as a `signature_delta` right before the
    /// thinking block stops.
    fn close_thinking(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.thinking_block.take() {
            let signature = self
                .pending_signature
                .take()
                .or_else(|| self.ctx.store.get(&self.ctx.session));
            if let Some(signature) = signature.filter(|signature| !signature.is_empty()) {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::SignatureDelta { signature },
                });
            }
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn close_text(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.text_block.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn close_open_blocks(&mut self, events: &mut Vec<StreamEvent>) {
        self.close_thinking(events);
        self.close_text(events);
        for (_, index) in std::mem::take(&mut self.tool_blocks) {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn emit_final(&mut self, events: &mut Vec<StreamEvent>) {
        if self.finish_emitted {
            return;
        }
        self.finish_emitted = true;
        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(self.pending_finish.take().unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: Some(DeltaUsage {
                input_tokens: Some(self.usage.input_tokens),
                output_tokens: Some(self.usage.output_tokens),
            }),
        });
        events.push(StreamEvent::MessageStop);
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
