use serde_json::{json, Value};

use anyproxy_protocol::claude::{
    ContentBlock, CreateMessageRequestBody, MessageContent, MessageParam, MessageRole,
    SystemPrompt, ThinkingConfig, ToolDefinition as ClaudeTool, ToolResultContent,
};
use anyproxy_protocol::gemini::{
    Content, ContentRole, GenerateContentRequestBody, Part,
};

use crate::helpers::synth_call_id;
use crate::thinking;
use crate::types::RequestContext;

const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_THINKING_BUDGET: u32 = 1024;

/// Convert a Gemini generateContent request into an Anthropic create-message
/// request.
pub fn transform_request(
    body: GenerateContentRequestBody,
    ctx: &RequestContext,
) -> CreateMessageRequestBody {
    let client_requested_thinking = body
        .generation_config
        .as_ref()
        .and_then(|config| config.thinking_config.as_ref())
        .and_then(|config| config.include_thoughts)
        .unwrap_or(false);
    let history_compatible = thinking::gemini_history_compatible(&body.contents);

    let messages = body
        .contents
        .iter()
        .filter_map(|content| map_content(content, ctx))
        .collect::<Vec<_>>();

    let system = body.system_instruction.as_ref().and_then(|system| {
        let texts: Vec<&str> = system
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .filter(|text| !text.is_empty())
            .collect();
        (!texts.is_empty()).then(|| SystemPrompt::Text(texts.join("\n")))
    });

    let tools = body.tools.as_ref().map(|tools| {
        tools
            .iter()
            .flat_map(|tool| &tool.function_declarations)
            .map(|declaration| ClaudeTool {
                name: declaration.name.clone(),
                description: declaration.description.clone(),
                input_schema: declaration
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect::<Vec<_>>()
    });

    let thinking = thinking::resolve_thinking(
        client_requested_thinking,
        ctx.target_model,
        history_compatible,
    )
    .then_some(ThinkingConfig::Enabled {
        budget_tokens: DEFAULT_THINKING_BUDGET,
    });

    let config = body.generation_config.unwrap_or_default();
    CreateMessageRequestBody {
        model: ctx.target_model.to_string(),
        messages,
        max_tokens: config.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system,
        temperature: config.temperature.map(|value| value.clamp(0.0, 1.0)),
        top_p: config.top_p,
        stop_sequences: config.stop_sequences.filter(|stops| !stops.is_empty()),
        stream: ctx.stream.then_some(true),
        tools,
        tool_choice: None,
        thinking,
        metadata: None,
    }
}

fn map_content(content: &Content, ctx: &RequestContext) -> Option<MessageParam> {
    let role = match content.role {
        Some(ContentRole::Model) => MessageRole::Assistant,
        _ => MessageRole::User,
    };

    let mut blocks = Vec::new();
    for part in &content.parts {
        if let Some(call) = &part.function_call {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone().unwrap_or_else(|| synth_call_id(&call.name)),
                name: call.name.clone(),
                input: call.args.clone().unwrap_or_else(|| json!({})),
            });
        } else if let Some(response) = &part.function_response {
            blocks.push(ContentBlock::ToolResult {
                tool_use_id: response
                    .id
                    .clone()
                    .unwrap_or_else(|| response.name.clone()),
                content: Some(ToolResultContent::Text(result_text(&response.response))),
                is_error: None,
            });
        } else if let Some(text) = part.text.as_deref() {
            if part.is_thought() {
                blocks.push(ContentBlock::Thinking {
                    thinking: text.to_string(),
                    signature: part
                        .thought_signature
                        .clone()
                        .or_else(|| ctx.store.get(ctx.session)),
                });
            } else if !text.is_empty() {
                blocks.push(ContentBlock::text(text));
            }
        }
    }

    if blocks.is_empty() {
        return None;
    }

    let content = match blocks.as_slice() {
        [ContentBlock::Text { text }] => MessageContent::Text(text.clone()),
        _ => MessageContent::Blocks(blocks),
    };
    Some(MessageParam { role, content })
}

fn result_text(response: &Value) -> String {
    match response.get("result") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => response.to_string(),
    }
}
