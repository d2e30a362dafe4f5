//! Thinking-block hygiene for signature-verifying upstreams, plus the
//! decision of whether a request may enable reasoning at all.

use tracing::{debug, info};

use anyproxy_protocol::claude::{ContentBlock, MessageContent, MessageParam, MessageRole};
use anyproxy_protocol::gemini::{Content, ContentRole, Part};

use crate::signature::{SignatureStore, MIN_SIGNATURE_LEN};
use crate::types::Request;

/// A signature is valid when it is long enough to be real, or when it rides
/// on an empty thinking block (the trailing-signature shape some upstreams
/// emit after the text finished).
pub fn has_valid_signature(thinking: &str, signature: Option<&str>) -> bool {
    match signature {
        Some(signature) if !signature.is_empty() => {
            thinking.is_empty() || signature.len() >= MIN_SIGNATURE_LEN
        }
        _ => false,
    }
}

/// Model names that imply a reasoning-capable upstream.
pub fn reasoning_model(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    model.contains("-thinking")
        || model.contains("gemini-3-pro")
        || model.contains("claude-")
        || model.contains("opus-4-5")
}

/// Whether reasoning may be enabled on the upstream request. History is
/// incompatible when the latest assistant turn used tools without a thinking
/// block: such a thread cannot be resumed in reasoning mode.
pub fn resolve_thinking(
    client_requested: bool,
    target_model: &str,
    history_compatible: bool,
) -> bool {
    if !client_requested && !reasoning_model(target_model) {
        return false;
    }
    if !history_compatible {
        if client_requested {
            info!(
                event = "thinking_refused",
                model = %target_model,
                reason = "history_tool_use_without_thinking"
            );
        }
        return false;
    }
    true
}

pub fn claude_history_compatible(messages: &[MessageParam]) -> bool {
    for message in messages.iter().rev() {
        if message.role != MessageRole::Assistant {
            continue;
        }
        let blocks = message.content.blocks();
        let has_tool_use = blocks
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse { .. }));
        let has_thinking = blocks
            .iter()
            .any(|block| matches!(block, ContentBlock::Thinking { .. }));
        return !(has_tool_use && !has_thinking);
    }
    true
}

pub fn gemini_history_compatible(contents: &[Content]) -> bool {
    for content in contents.iter().rev() {
        if content.role != Some(ContentRole::Model) {
            continue;
        }
        let has_call = content.parts.iter().any(|part| part.function_call.is_some());
        let has_thought = content.parts.iter().any(Part::is_thought);
        return !(has_call && !has_thought);
    }
    true
}

/// Scan assistant turns and fix up thinking blocks before an upstream that
/// verifies signatures sees them: keep valid ones, repair from the store,
/// demote unsalvageable text to a plain text block, drop empty leftovers.
/// Returns how many blocks were demoted or dropped.
pub fn filter_invalid_thinking(
    messages: &mut [MessageParam],
    store: &SignatureStore,
    session: &str,
) -> usize {
    let stored = store
        .get(session)
        .filter(|signature| signature.len() >= MIN_SIGNATURE_LEN);
    let mut filtered = 0;

    for message in messages.iter_mut() {
        if message.role != MessageRole::Assistant {
            continue;
        }
        let MessageContent::Blocks(blocks) = &mut message.content else {
            continue;
        };

        let mut kept = Vec::with_capacity(blocks.len());
        for block in blocks.drain(..) {
            match block {
                ContentBlock::Thinking {
                    thinking,
                    signature,
                } => {
                    if has_valid_signature(&thinking, signature.as_deref()) {
                        kept.push(ContentBlock::Thinking {
                            thinking,
                            signature,
                        });
                    } else if let Some(repair) = &stored {
                        debug!(event = "thinking_repaired", len = thinking.len());
                        kept.push(ContentBlock::Thinking {
                            thinking,
                            signature: Some(repair.clone()),
                        });
                    } else if !thinking.trim().is_empty() {
                        debug!(event = "thinking_demoted", len = thinking.len());
                        kept.push(ContentBlock::Text { text: thinking });
                        filtered += 1;
                    } else {
                        filtered += 1;
                    }
                }
                other => kept.push(other),
            }
        }

        if kept.is_empty() {
            kept.push(ContentBlock::text(""));
        }
        *blocks = kept;
    }

    filtered
}

/// Gemini flavour of the same pass over `thought` parts.
pub fn filter_invalid_thought_parts(
    contents: &mut [Content],
    store: &SignatureStore,
    session: &str,
) -> usize {
    let stored = store
        .get(session)
        .filter(|signature| signature.len() >= MIN_SIGNATURE_LEN);
    let mut filtered = 0;

    for content in contents.iter_mut() {
        if content.role != Some(ContentRole::Model) {
            continue;
        }

        let mut kept = Vec::with_capacity(content.parts.len());
        for mut part in content.parts.drain(..) {
            if !part.is_thought() {
                kept.push(part);
                continue;
            }
            let text = part.text.clone().unwrap_or_default();
            if has_valid_signature(&text, part.thought_signature.as_deref()) {
                kept.push(part);
            } else if let Some(repair) = &stored {
                part.thought_signature = Some(repair.clone());
                kept.push(part);
            } else if !text.trim().is_empty() {
                kept.push(Part::text(text));
                filtered += 1;
            } else {
                filtered += 1;
            }
        }

        if kept.is_empty() {
            kept.push(Part::text(""));
        }
        content.parts = kept;
    }

    filtered
}

/// Degradation pass for the signature-error retry: every thinking trace is
/// demoted to plain text and the reasoning flag is cleared.
pub fn demote_thinking(request: &mut Request) {
    match request {
        Request::Claude(body) => {
            for message in &mut body.messages {
                let MessageContent::Blocks(blocks) = &mut message.content else {
                    continue;
                };
                let mut kept = Vec::with_capacity(blocks.len());
                for block in blocks.drain(..) {
                    match block {
                        ContentBlock::Thinking { thinking, .. } => {
                            if !thinking.is_empty() {
                                kept.push(ContentBlock::Text { text: thinking });
                            }
                        }
                        other => kept.push(other),
                    }
                }
                if kept.is_empty() {
                    kept.push(ContentBlock::text(""));
                }
                *blocks = kept;
            }
            body.thinking = None;
        }
        Request::Gemini(body) => {
            for content in &mut body.contents {
                let mut kept = Vec::with_capacity(content.parts.len());
                for part in content.parts.drain(..) {
                    if part.is_thought() {
                        let text = part.text.unwrap_or_default();
                        if !text.is_empty() {
                            kept.push(Part::text(text));
                        }
                    } else {
                        kept.push(part);
                    }
                }
                if kept.is_empty() {
                    kept.push(Part::text(""));
                }
                content.parts = kept;
            }
            if let Some(config) = &mut body.generation_config {
                config.thinking_config = None;
            }
        }
        Request::OpenAI(body) => {
            for message in &mut body.messages {
                if let anyproxy_protocol::openai::ChatMessage::Assistant {
                    reasoning_content, ..
                } = message
                {
                    *reasoning_content = None;
                }
            }
            body.reasoning_effort = None;
        }
    }
}

/// Second-stage degradation: drop signatures that ride on tool parts.
pub fn strip_tool_signatures(request: &mut Request) {
    if let Request::Gemini(body) = request {
        for content in &mut body.contents {
            for part in &mut content.parts {
                if part.function_call.is_some() || part.function_response.is_some() {
                    part.thought_signature = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyproxy_protocol::claude::MessageRole;

    fn assistant(blocks: Vec<ContentBlock>) -> MessageParam {
        MessageParam {
            role: MessageRole::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    #[test]
    fn signature_validity_rules() {
        assert!(has_valid_signature("text", Some(&"x".repeat(50))));
        assert!(!has_valid_signature("text", Some("short")));
        assert!(has_valid_signature("", Some("short")));
        assert!(!has_valid_signature("text", None));
        assert!(!has_valid_signature("", Some("")));
    }

    #[test]
    fn reasoning_markers() {
        assert!(reasoning_model("claude-sonnet-4-5"));
        assert!(reasoning_model("gemini-3-pro-preview"));
        assert!(reasoning_model("qwen-max-thinking"));
        assert!(reasoning_model("opus-4-5"));
        assert!(!reasoning_model("gpt-4o-mini"));
    }

    #[test]
    fn incompatible_history_disables_thinking() {
        let messages = vec![assistant(vec![ContentBlock::ToolUse {
            id: "t".into(),
            name: "f".into(),
            input: serde_json::json!({}),
        }])];
        assert!(!claude_history_compatible(&messages));
        assert!(!resolve_thinking(true, "claude-sonnet-4-5", false));
        assert!(resolve_thinking(false, "claude-sonnet-4-5", true));
        assert!(!resolve_thinking(false, "gpt-4o", true));
    }

    #[test]
    fn thinking_plus_tool_use_history_is_compatible() {
        let messages = vec![assistant(vec![
            ContentBlock::Thinking {
                thinking: "hm".into(),
                signature: Some("s".repeat(60)),
            },
            ContentBlock::ToolUse {
                id: "t".into(),
                name: "f".into(),
                input: serde_json::json!({}),
            },
        ])];
        assert!(claude_history_compatible(&messages));
    }

    #[test]
    fn filter_repairs_from_the_store() {
        let store = SignatureStore::new();
        store.store("s", &"g".repeat(80));
        let mut messages = vec![assistant(vec![ContentBlock::Thinking {
            thinking: "kept".into(),
            signature: Some("bad".into()),
        }])];
        let filtered = filter_invalid_thinking(&mut messages, &store, "s");
        assert_eq!(filtered, 0);
        match &messages[0].content.blocks()[0] {
            ContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref().unwrap().len(), 80)
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn filter_demotes_unsalvageable_thinking_to_text() {
        let store = SignatureStore::new();
        let mut messages = vec![assistant(vec![ContentBlock::Thinking {
            thinking: "no proof".into(),
            signature: None,
        }])];
        let filtered = filter_invalid_thinking(&mut messages, &store, "s");
        assert_eq!(filtered, 1);
        assert!(matches!(
            messages[0].content.blocks()[0],
            ContentBlock::Text { .. }
        ));
    }

    #[test]
    fn filter_backfills_an_emptied_message() {
        let store = SignatureStore::new();
        let mut messages = vec![assistant(vec![ContentBlock::Thinking {
            thinking: "  ".into(),
            signature: None,
        }])];
        filter_invalid_thinking(&mut messages, &store, "s");
        let blocks = messages[0].content.blocks();
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], ContentBlock::Text { text } if text.is_empty()));
    }

    #[test]
    fn demote_thinking_clears_claude_config_and_blocks() {
        let mut request = Request::Claude(anyproxy_protocol::claude::CreateMessageRequestBody {
            model: "m".into(),
            messages: vec![assistant(vec![ContentBlock::Thinking {
                thinking: "trace".into(),
                signature: Some("s".repeat(60)),
            }])],
            max_tokens: 16,
            system: None,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            thinking: Some(anyproxy_protocol::claude::ThinkingConfig::Enabled {
                budget_tokens: 1024,
            }),
            metadata: None,
        });
        demote_thinking(&mut request);
        let Request::Claude(body) = &request else {
            unreachable!()
        };
        assert!(body.thinking.is_none());
        assert!(matches!(
            body.messages[0].content.blocks()[0],
            ContentBlock::Text { .. }
        ));
    }
}
