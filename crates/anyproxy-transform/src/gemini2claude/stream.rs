use serde_json::json;

use anyproxy_protocol::claude::{
    BlockDelta, ContentBlock, DeltaUsage, Message, MessageDelta, MessageRole, MessageType,
    StopReason, StreamEvent, Usage,
};
use anyproxy_protocol::gemini::{
    FinishReason as GeminiFinishReason, GenerateContentResponse,
};

use crate::helpers::{arguments_string, synth_call_id, synth_message_id};
use crate::types::{StreamContext, UsageTotals};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
}

/// Re-emits a Gemini streaming response as Anthropic SSE events with
/// explicit block framing.
pub struct GeminiToClaudeStreamState {
    ctx: StreamContext,
    started: bool,
    finish_emitted: bool,
    next_block_index: u32,
    active: Option<(BlockKind, u32)>,
    pending_signature: Option<String>,
    saw_tool_use: bool,
    stop_reason: Option<StopReason>,
    usage: UsageTotals,
}

impl GeminiToClaudeStreamState {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            started: false,
            finish_emitted: false,
            next_block_index: 0,
            active: None,
            pending_signature: None,
            saw_tool_use: false,
            stop_reason: None,
            usage: UsageTotals::default(),
        }
    }

    pub fn transform_chunk(&mut self, chunk: GenerateContentResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message: Message {
                    id: chunk
                        .response_id
                        .clone()
                        .unwrap_or_else(|| synth_message_id("msg_gemini")),
                    kind: MessageType::Message,
                    role: MessageRole::Assistant,
                    content: Vec::new(),
                    model: self.ctx.client_model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage::default(),
                },
            });
        }

        if let Some(usage) = &chunk.usage_metadata {
            self.usage.merge(UsageTotals {
                input_tokens: usage.prompt_token_count.unwrap_or(0),
                output_tokens: usage.candidates_token_count.unwrap_or(0),
            });
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return events;
        };

        if let Some(content) = candidate.content {
            for part in content.parts {
                if let Some(call) = part.function_call {
                    self.saw_tool_use = true;
                    self.close_active(&mut events);
                    let index = self.allocate_block();
                    events.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlock::ToolUse {
                            id: call.id.unwrap_or_else(|| synth_call_id(&call.name)),
                            name: call.name,
                            input: json!({}),
                        },
                    });
                    if let Some(args) = &call.args {
                        events.push(StreamEvent::ContentBlockDelta {
                            index,
                            delta: BlockDelta::InputJsonDelta {
                                partial_json: arguments_string(args),
                            },
                        });
                    }
                    events.push(StreamEvent::ContentBlockStop { index });
                    continue;
                }

                let thought = part.thought.unwrap_or(false);
                if let Some(signature) = part.thought_signature.as_deref() {
                    if !signature.is_empty() {
                        self.ctx.store.store(&self.ctx.session, signature);
                        self.capture_signature(signature);
                    }
                }
                if let Some(text) = part.text {
                    if text.is_empty() {
                        continue;
                    }
                    if thought {
                        let index = self.ensure_block(BlockKind::Thinking, &mut events);
                        events.push(StreamEvent::ContentBlockDelta {
                            index,
                            delta: BlockDelta::ThinkingDelta { thinking: text },
                        });
                    } else {
                        let index = self.ensure_block(BlockKind::Text, &mut events);
                        events.push(StreamEvent::ContentBlockDelta {
                            index,
                            delta: BlockDelta::TextDelta { text },
                        });
                    }
                }
            }
        }

        if let Some(reason) = candidate.finish_reason {
            self.stop_reason = Some(map_finish_reason(reason, self.saw_tool_use));
            self.close_active(&mut events);
            self.emit_final(&mut events);
        }

        events
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.started {
            return events;
        }
        self.close_active(&mut events);
        self.emit_final(&mut events);
        events
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    fn capture_signature(&mut self, signature: &str) {
        let longer = self
            .pending_signature
            .as_ref()
            .is_none_or(|existing| signature.len() > existing.len());
        if longer {
            self.pending_signature = Some(signature.to_string());
        }
    }

    fn ensure_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some((active_kind, index)) = self.active {
            if active_kind == kind {
                return index;
            }
            self.close_active(events);
        }
        let index = self.allocate_block();
        self.active = Some((kind, index));
        let content_block = match kind {
            BlockKind::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
            BlockKind::Text => ContentBlock::text(""),
        };
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        index
    }

    fn close_active(&mut self, events: &mut Vec<StreamEvent>) {
        let Some((kind, index)) = self.active.take() else {
            return;
        };
        if kind == BlockKind::Thinking {
            if let Some(signature) = self.pending_signature.take() {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::SignatureDelta { signature },
                });
            }
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }

    fn allocate_block(&mut self) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    fn emit_final(&mut self, events: &mut Vec<StreamEvent>) {
        if self.finish_emitted {
            return;
        }
        self.finish_emitted = true;
        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(self.stop_reason.take().unwrap_or(StopReason::EndTurn)),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureStore;
    use anyproxy_protocol::gemini::{Candidate, Content, ContentRole, Part, UsageMetadata};
    use std::sync::Arc;

    fn ctx() -> StreamContext {
        StreamContext {
            client_model: "claude-visible".into(),
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
                prompt_token_count: Some(2),
                candidates_token_count: Some(6),
                total_token_count: Some(8),
                thoughts_token_count: None,
            }),
            model_version: None,
            response_id: Some("resp_1".into()),
        }
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    #[test]
    fn thought_then_text_produces_balanced_blocks_with_signature_flush() {
        let context = ctx();
        let store = context.store.clone();
        let mut state = GeminiToClaudeStreamState::new(context);
        let sig = "y".repeat(60);

        let mut events =
            state.transform_chunk(chunk(vec![Part::thought("why", Some(sig.clone()))], None));
        events.extend(state.transform_chunk(chunk(
            vec![Part::text("done")],
            Some(GeminiFinishReason::Stop),
        )));

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta", // signature flush
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(matches!(
            &events[3],
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::SignatureDelta { signature },
                ..
            } if *signature == sig
        ));
        assert_eq!(store.get("s").unwrap(), sig);
        assert!(state.finish().is_empty());
    }

    #[test]
    fn function_calls_become_self_contained_tool_blocks() {
        let mut state = GeminiToClaudeStreamState::new(ctx());
        let events = state.transform_chunk(chunk(
            vec![Part {
                function_call: Some(anyproxy_protocol::gemini::FunctionCall {
                    name: "get_time".into(),
                    args: Some(serde_json::json!({"tz": "UTC"})),
                    id: None,
                }),
                ..Default::default()
            }],
            Some(GeminiFinishReason::Stop),
        ));
        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        match &events[4] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn abrupt_end_closes_open_blocks() {
        let mut state = GeminiToClaudeStreamState::new(ctx());
        state.transform_chunk(chunk(vec![Part::text("half")], None));
        let events = state.finish();
        assert_eq!(
            names(&events),
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
    }
}
