use std::collections::HashMap;

use serde_json::{json, Value};

use anyproxy_protocol::gemini::{
    Blob, Content, ContentRole, FunctionCall as GeminiFunctionCall, FunctionDeclaration,
    FunctionResponse, GenerateContentRequestBody, GenerationConfig, Part,
    ThinkingConfig as GeminiThinkingConfig, Tool,
};
use anyproxy_protocol::openai::{
    ChatCompletionRequestBody, ChatMessage, ContentPart, TextOrParts, ToolChoice,
};

use crate::helpers::{materialize_placeholder, parse_data_url, parse_tool_arguments};
use crate::thinking;
use crate::types::RequestContext;

/// Convert an OpenAI chat-completions request into a Gemini generateContent
/// request. Gemini has no stable tool-call ids of its own, so the client's
/// ids ride along in `functionCall.id`/`functionResponse.id`.
pub fn transform_request(
    body: ChatCompletionRequestBody,
    ctx: &RequestContext,
) -> GenerateContentRequestBody {
    let client_requested_thinking = body
        .reasoning_effort
        .as_deref()
        .is_some_and(|effort| effort != "none");

    // tool_call_id -> function name, for functionResponse correlation.
    let mut call_names: HashMap<String, String> = HashMap::new();
    for message in &body.messages {
        if let ChatMessage::Assistant {
            tool_calls: Some(calls),
            ..
        } = message
        {
            for call in calls {
                call_names.insert(call.id.clone(), call.function.name.clone());
            }
        }
    }

    let mut system_texts = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for message in &body.messages {
        match message {
            ChatMessage::System { content } | ChatMessage::Developer { content } => {
                let text = content.joined_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            ChatMessage::User { content } => {
                let parts = map_user_parts(content);
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some(ContentRole::User),
                        parts,
                    });
                }
            }
            ChatMessage::Assistant {
                content,
                reasoning_content,
                tool_calls,
            } => {
                let mut parts = Vec::new();
                if let Some(reasoning) = reasoning_content.as_deref() {
                    if !reasoning.is_empty() {
                        parts.push(Part::thought(reasoning, ctx.store.get(ctx.session)));
                    }
                }
                if let Some(content) = content {
                    let text = content.joined_text();
                    if !text.is_empty() {
                        parts.push(Part::text(text));
                    }
                }
                for call in tool_calls.iter().flatten() {
                    parts.push(Part {
                        function_call: Some(GeminiFunctionCall {
                            name: call.function.name.clone(),
                            args: Some(parse_tool_arguments(&call.function.arguments)),
                            id: Some(call.id.clone()),
                        }),
                        ..Default::default()
                    });
                }
                if parts.is_empty() {
                    parts.push(Part::text(""));
                }
                contents.push(Content {
                    role: Some(ContentRole::Model),
                    parts,
                });
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                let name = call_names
                    .get(tool_call_id)
                    .cloned()
                    .unwrap_or_else(|| tool_call_id.clone());
                contents.push(Content {
                    role: Some(ContentRole::User),
                    parts: vec![Part {
                        function_response: Some(FunctionResponse {
                            name,
                            response: json!({
                                "result": materialize_placeholder(content.joined_text())
                            }),
                            id: Some(tool_call_id.clone()),
                        }),
                        ..Default::default()
                    }],
                });
            }
        }
    }

    let system_instruction = (!system_texts.is_empty()).then(|| Content {
        role: None,
        parts: vec![Part::text(system_texts.join("\n\n"))],
    });

    let tools = body.tools.as_ref().map(|tools| {
        vec![Tool {
            function_declarations: tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone(),
                    parameters: tool.function.parameters.clone(),
                })
                .collect(),
        }]
    });

    let history_compatible = thinking::gemini_history_compatible(&contents);
    let thinking_config = thinking::resolve_thinking(
        client_requested_thinking,
        ctx.target_model,
        history_compatible,
    )
    .then_some(GeminiThinkingConfig {
        include_thoughts: Some(true),
        thinking_budget: None,
    });

    let generation_config = GenerationConfig {
        temperature: body.temperature,
        top_p: body.top_p,
        max_output_tokens: body.max_completion_tokens.or(body.max_tokens),
        stop_sequences: body.stop.map(|stop| stop.into_vec()),
        thinking_config,
    };

    GenerateContentRequestBody {
        contents,
        system_instruction,
        tools,
        tool_config: body.tool_choice.map(map_tool_config),
        generation_config: Some(generation_config),
        safety_settings: None,
        model: None,
        stream: None,
    }
}

fn map_user_parts(content: &TextOrParts) -> Vec<Part> {
    match content {
        TextOrParts::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![Part::text(text.clone())]
            }
        }
        TextOrParts::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => {
                    (!text.is_empty()).then(|| Part::text(text.clone()))
                }
                ContentPart::ImageUrl { image_url } => {
                    parse_data_url(&image_url.url).map(|(mime_type, data)| Part {
                        inline_data: Some(Blob {
                            mime_type,
                            data,
                        }),
                        ..Default::default()
                    })
                }
            })
            .collect(),
    }
}

fn map_tool_config(choice: ToolChoice) -> Value {
    match choice {
        ToolChoice::Mode(mode) => {
            let mode = match mode.as_str() {
                "none" => "NONE",
                "required" => "ANY",
                _ => "AUTO",
            };
            json!({"functionCallingConfig": {"mode": mode}})
        }
        ToolChoice::Named(named) => json!({
            "functionCallingConfig": {
                "mode": "ANY",
                "allowedFunctionNames": [named.function.name],
            }
        }),
    }
}
