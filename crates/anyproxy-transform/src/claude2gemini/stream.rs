use std::collections::BTreeMap;

use anyproxy_protocol::claude::{BlockDelta, ContentBlock, StopReason, StreamEvent};
use anyproxy_protocol::gemini::{
    Candidate, Content, ContentRole, FinishReason as GeminiFinishReason,
    FunctionCall as GeminiFunctionCall, GenerateContentResponse, Part, UsageMetadata,
};

use crate::helpers::synth_message_id;
use crate::types::{StreamContext, UsageTotals};

#[derive(Debug, Clone)]
struct PendingTool {
    id: String,
    name: String,
    arguments: String,
}

/// Re-emits an Anthropic SSE event stream as Gemini streaming responses.
/// Tool input JSON accumulates until the block stops; Gemini carries whole
/// `functionCall` parts.
pub struct ClaudeToGeminiStreamState {
    ctx: StreamContext,
    response_id: String,
    stop_reason: Option<StopReason>,
    saw_tool_use: bool,
    tool_blocks: BTreeMap<u32, PendingTool>,
    usage: UsageTotals,
    finished: bool,
}

impl ClaudeToGeminiStreamState {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            response_id: synth_message_id("response"),
            stop_reason: None,
            saw_tool_use: false,
            tool_blocks: BTreeMap::new(),
            usage: UsageTotals::default(),
            finished: false,
        }
    }

    pub fn transform_event(&mut self, event: StreamEvent) -> Vec<GenerateContentResponse> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.response_id = message.id;
                self.usage.merge(UsageTotals {
                    input_tokens: message.usage.input_tokens,
                    output_tokens: message.usage.output_tokens,
                });
                Vec::new()
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { text } => self.emit_parts(vec![Part::text(text)]),
                ContentBlock::Thinking {
                    thinking,
                    signature,
                } => self.emit_parts(vec![Part::thought(thinking, signature)]),
                ContentBlock::ToolUse { id, name, input } => {
                    self.saw_tool_use = true;
                    let arguments = if input.is_object()
                        && !input.as_object().is_some_and(|map| map.is_empty())
                    {
                        input.to_string()
                    } else {
                        String::new()
                    };
                    self.tool_blocks.insert(
                        index,
                        PendingTool {
                            id,
                            name,
                            arguments,
                        },
                    );
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => self.emit_parts(vec![Part::text(text)]),
                BlockDelta::ThinkingDelta { thinking } => {
                    self.emit_parts(vec![Part::thought(thinking, None)])
                }
                BlockDelta::SignatureDelta { signature } => {
                    if signature.is_empty() {
                        return Vec::new();
                    }
                    self.ctx.store.store(&self.ctx.session, &signature);
                    self.emit_parts(vec![Part {
                        thought: Some(true),
                        thought_signature: Some(signature),
                        ..Default::default()
                    }])
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(pending) = self.tool_blocks.get_mut(&index) {
                        pending.arguments.push_str(&partial_json);
                    }
                    Vec::new()
                }
            },
            StreamEvent::ContentBlockStop { index } => {
                let Some(pending) = self.tool_blocks.remove(&index) else {
                    return Vec::new();
                };
                let args = if pending.arguments.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&pending.arguments)
                        .unwrap_or_else(|_| serde_json::Value::String(pending.arguments.clone()))
                };
                self.emit_parts(vec![Part {
                    function_call: Some(GeminiFunctionCall {
                        name: pending.name,
                        args: Some(args),
                        id: Some(pending.id),
                    }),
                    ..Default::default()
                }])
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason.or(self.stop_reason);
                if let Some(usage) = usage {
                    self.usage.merge(UsageTotals {
                        input_tokens: usage.input_tokens.unwrap_or(0),
                        output_tokens: usage.output_tokens.unwrap_or(0),
                    });
                }
                Vec::new()
            }
            StreamEvent::MessageStop => self.finish(),
            StreamEvent::Ping | StreamEvent::Error { .. } => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Vec<GenerateContentResponse> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let finish_reason = self
            .stop_reason
            .map(map_stop_reason)
            .unwrap_or(GeminiFinishReason::Stop);
        vec![GenerateContentResponse {
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
        }]
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    fn emit_parts(&self, parts: Vec<Part>) -> Vec<GenerateContentResponse> {
        let parts: Vec<Part> = parts.into_iter().filter(part_has_payload).collect();
        if parts.is_empty() {
            return Vec::new();
        }
        vec![GenerateContentResponse {
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
        }]
    }
}

fn part_has_payload(part: &Part) -> bool {
    part.text.as_ref().is_some_and(|text| !text.is_empty())
        || part.function_call.is_some()
        || part.function_response.is_some()
        || part.inline_data.is_some()
        || part.thought_signature.is_some()
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
