//! Enum-dispatched transformation entry points. The engine picks a source
//! and destination protocol; this module routes payloads through the right
//! directional converter and applies the passes that run at the upstream
//! boundary regardless of direction (thinking filter, Gemini schema
//! sanitizing, signature capture).

use anyproxy_protocol::claude::{BlockDelta, ContentBlock, StreamEvent};

use crate::signature::SignatureStore;
use crate::types::{
    ChunkEvent, Proto, Request, RequestContext, Response, ResponseContext, StreamContext,
    TransformError, UsageTotals,
};
use crate::{
    claude2gemini, claude2openai, gemini2claude, gemini2openai, openai2claude, openai2gemini,
    schema, thinking,
};

/// Transform a decoded client request (`src`-shaped) into the upstream's
/// shape (`dst`). The identity direction still rewrites the model, and every
/// signature-verifying destination gets the thinking filter and (for Gemini)
/// schema sanitizing.
pub fn transform_request(
    src: Proto,
    dst: Proto,
    req: Request,
    ctx: &RequestContext,
) -> Result<Request, TransformError> {
    if req.proto() != src {
        return Err(TransformError::ProtoMismatch);
    }

    let mut out = if src == dst {
        identity_request(req, ctx)
    } else {
        match req {
            Request::OpenAI(body) => match dst {
                Proto::Claude => {
                    Request::Claude(openai2claude::request::transform_request(body, ctx))
                }
                Proto::Gemini => {
                    Request::Gemini(openai2gemini::request::transform_request(body, ctx))
                }
                Proto::OpenAI => unreachable!("identity handled above"),
            },
            Request::Claude(body) => match dst {
                Proto::OpenAI => {
                    Request::OpenAI(claude2openai::request::transform_request(body, ctx))
                }
                Proto::Gemini => {
                    Request::Gemini(claude2gemini::request::transform_request(body, ctx))
                }
                Proto::Claude => unreachable!("identity handled above"),
            },
            Request::Gemini(body) => match dst {
                Proto::OpenAI => {
                    Request::OpenAI(gemini2openai::request::transform_request(body, ctx))
                }
                Proto::Claude => {
                    Request::Claude(gemini2claude::request::transform_request(body, ctx))
                }
                Proto::Gemini => unreachable!("identity handled above"),
            },
        }
    };

    finalize_upstream_request(&mut out, ctx);
    Ok(out)
}

fn identity_request(req: Request, ctx: &RequestContext) -> Request {
    match req {
        Request::OpenAI(mut body) => {
            body.model = ctx.target_model.to_string();
            if ctx.stream {
                body.stream = Some(true);
                body.ensure_stream_usage();
            }
            Request::OpenAI(body)
        }
        Request::Claude(mut body) => {
            body.model = ctx.target_model.to_string();
            if ctx.stream {
                body.stream = Some(true);
            }
            Request::Claude(body)
        }
        Request::Gemini(mut body) => {
            // The model rides in the upstream path, and the stream flag is an
            // endpoint choice, not a body field, on the Gemini side.
            body.model = None;
            body.stream = None;
            Request::Gemini(body)
        }
    }
}

fn finalize_upstream_request(req: &mut Request, ctx: &RequestContext) {
    match req {
        Request::Claude(body) => {
            thinking::filter_invalid_thinking(&mut body.messages, ctx.store, ctx.session);
        }
        Request::Gemini(body) => {
            thinking::filter_invalid_thought_parts(&mut body.contents, ctx.store, ctx.session);
            if let Some(tools) = &mut body.tools {
                for tool in tools {
                    for declaration in &mut tool.function_declarations {
                        if let Some(parameters) = &declaration.parameters {
                            declaration.parameters =
                                Some(schema::sanitize_for_gemini(parameters));
                        }
                    }
                }
            }
        }
        Request::OpenAI(_) => {}
    }
}

/// Transform an upstream response (`src`-shaped) into the client's shape
/// (`dst`). Identity responses pass through untouched apart from signature
/// capture.
pub fn transform_response(
    src: Proto,
    dst: Proto,
    resp: Response,
    ctx: &ResponseContext,
) -> Result<Response, TransformError> {
    if resp.proto() != src {
        return Err(TransformError::ProtoMismatch);
    }
    if src == dst {
        capture_signatures(&resp, ctx.store, ctx.session);
        return Ok(resp);
    }

    Ok(match resp {
        Response::OpenAI(resp) => match dst {
            Proto::Claude => {
                Response::Claude(openai2claude::response::transform_response(resp, ctx))
            }
            Proto::Gemini => {
                Response::Gemini(openai2gemini::response::transform_response(resp, ctx))
            }
            Proto::OpenAI => unreachable!("identity handled above"),
        },
        Response::Claude(resp) => match dst {
            Proto::OpenAI => {
                Response::OpenAI(claude2openai::response::transform_response(resp, ctx))
            }
            Proto::Gemini => {
                Response::Gemini(claude2gemini::response::transform_response(resp, ctx))
            }
            Proto::Claude => unreachable!("identity handled above"),
        },
        Response::Gemini(resp) => match dst {
            Proto::OpenAI => {
                Response::OpenAI(gemini2openai::response::transform_response(resp, ctx))
            }
            Proto::Claude => {
                Response::Claude(gemini2claude::response::transform_response(resp, ctx))
            }
            Proto::Gemini => unreachable!("identity handled above"),
        },
    })
}

/// Token totals for the usage log, pulled from whichever shape the response
/// has. Missing fields read as zero.
pub fn response_usage(resp: &Response) -> UsageTotals {
    match resp {
        Response::OpenAI(resp) => resp
            .usage
            .as_ref()
            .map(|usage| UsageTotals {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_default(),
        Response::Claude(resp) => UsageTotals {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
        Response::Gemini(resp) => resp
            .usage_metadata
            .as_ref()
            .map(|usage| UsageTotals {
                input_tokens: usage.prompt_token_count.unwrap_or(0),
                output_tokens: usage.candidates_token_count.unwrap_or(0),
            })
            .unwrap_or_default(),
    }
}

fn capture_signatures(resp: &Response, store: &SignatureStore, session: &str) {
    match resp {
        Response::Claude(message) => {
            for block in &message.content {
                if let ContentBlock::Thinking {
                    signature: Some(signature),
                    ..
                } = block
                {
                    store.store(session, signature);
                }
            }
        }
        Response::Gemini(resp) => {
            for candidate in &resp.candidates {
                if let Some(content) = &candidate.content {
                    for part in &content.parts {
                        if let Some(signature) = part.thought_signature.as_deref() {
                            store.store(session, signature);
                        }
                    }
                }
            }
        }
        Response::OpenAI(resp) => {
            for choice in &resp.choices {
                if let Some(signature) = choice.message.signature.as_deref() {
                    store.store(session, signature);
                }
            }
        }
    }
}

/// One streaming transcoder instance per request: upstream events in, client
/// events out. The identity arm forwards untouched but still captures
/// signatures and usage for accounting.
pub enum StreamTransformer {
    Passthrough {
        proto: Proto,
        ctx: StreamContext,
        usage: UsageTotals,
    },
    ClaudeToOpenAI(claude2openai::stream::ClaudeToOpenAIStreamState),
    OpenAIToClaude(openai2claude::stream::OpenAIToClaudeStreamState),
    ClaudeToGemini(claude2gemini::stream::ClaudeToGeminiStreamState),
    OpenAIToGemini(openai2gemini::stream::OpenAIToGeminiStreamState),
    GeminiToClaude(gemini2claude::stream::GeminiToClaudeStreamState),
    GeminiToOpenAI(gemini2openai::stream::GeminiToOpenAIStreamState),
}

impl StreamTransformer {
    /// `upstream` is the protocol of incoming chunks, `client` the protocol
    /// of emitted events.
    pub fn new(upstream: Proto, client: Proto, ctx: StreamContext) -> Self {
        if upstream == client {
            return StreamTransformer::Passthrough {
                proto: upstream,
                ctx,
                usage: UsageTotals::default(),
            };
        }
        match (upstream, client) {
            (Proto::Claude, Proto::OpenAI) => StreamTransformer::ClaudeToOpenAI(
                claude2openai::stream::ClaudeToOpenAIStreamState::new(ctx),
            ),
            (Proto::OpenAI, Proto::Claude) => StreamTransformer::OpenAIToClaude(
                openai2claude::stream::OpenAIToClaudeStreamState::new(ctx),
            ),
            (Proto::Claude, Proto::Gemini) => StreamTransformer::ClaudeToGemini(
                claude2gemini::stream::ClaudeToGeminiStreamState::new(ctx),
            ),
            (Proto::OpenAI, Proto::Gemini) => StreamTransformer::OpenAIToGemini(
                openai2gemini::stream::OpenAIToGeminiStreamState::new(ctx),
            ),
            (Proto::Gemini, Proto::Claude) => StreamTransformer::GeminiToClaude(
                gemini2claude::stream::GeminiToClaudeStreamState::new(ctx),
            ),
            (Proto::Gemini, Proto::OpenAI) => StreamTransformer::GeminiToOpenAI(
                gemini2openai::stream::GeminiToOpenAIStreamState::new(ctx),
            ),
            _ => unreachable!("identity handled above"),
        }
    }

    pub fn push(&mut self, event: ChunkEvent) -> Result<Vec<ChunkEvent>, TransformError> {
        match self {
            StreamTransformer::Passthrough { proto, ctx, usage } => {
                passthrough_capture(*proto, &event, ctx, usage)?;
                Ok(vec![event])
            }
            StreamTransformer::ClaudeToOpenAI(state) => match event {
                ChunkEvent::Claude(event) => Ok(state
                    .transform_event(event)
                    .into_iter()
                    .map(ChunkEvent::OpenAI)
                    .collect()),
                _ => Err(TransformError::ProtoMismatch),
            },
            StreamTransformer::OpenAIToClaude(state) => match event {
                ChunkEvent::OpenAI(chunk) => Ok(state
                    .transform_chunk(chunk)
                    .into_iter()
                    .map(ChunkEvent::Claude)
                    .collect()),
                _ => Err(TransformError::ProtoMismatch),
            },
            StreamTransformer::ClaudeToGemini(state) => match event {
                ChunkEvent::Claude(event) => Ok(state
                    .transform_event(event)
                    .into_iter()
                    .map(ChunkEvent::Gemini)
                    .collect()),
                _ => Err(TransformError::ProtoMismatch),
            },
            StreamTransformer::OpenAIToGemini(state) => match event {
                ChunkEvent::OpenAI(chunk) => Ok(state
                    .transform_chunk(chunk)
                    .into_iter()
                    .map(ChunkEvent::Gemini)
                    .collect()),
                _ => Err(TransformError::ProtoMismatch),
            },
            StreamTransformer::GeminiToClaude(state) => match event {
                ChunkEvent::Gemini(chunk) => Ok(state
                    .transform_chunk(chunk)
                    .into_iter()
                    .map(ChunkEvent::Claude)
                    .collect()),
                _ => Err(TransformError::ProtoMismatch),
            },
            StreamTransformer::GeminiToOpenAI(state) => match event {
                ChunkEvent::Gemini(chunk) => Ok(state
                    .transform_chunk(chunk)
                    .into_iter()
                    .map(ChunkEvent::OpenAI)
                    .collect()),
                _ => Err(TransformError::ProtoMismatch),
            },
        }
    }

    /// Emit whatever closing events the client protocol still needs so the
    /// stream's framing invariants hold even on an abrupt upstream end.
    pub fn finish(&mut self) -> Vec<ChunkEvent> {
        match self {
            StreamTransformer::Passthrough { .. } => Vec::new(),
            StreamTransformer::ClaudeToOpenAI(state) => state
                .finish()
                .into_iter()
                .map(ChunkEvent::OpenAI)
                .collect(),
            StreamTransformer::OpenAIToClaude(state) => state
                .finish()
                .into_iter()
                .map(ChunkEvent::Claude)
                .collect(),
            StreamTransformer::ClaudeToGemini(state) => state
                .finish()
                .into_iter()
                .map(ChunkEvent::Gemini)
                .collect(),
            StreamTransformer::OpenAIToGemini(state) => state
                .finish()
                .into_iter()
                .map(ChunkEvent::Gemini)
                .collect(),
            StreamTransformer::GeminiToClaude(state) => state
                .finish()
                .into_iter()
                .map(ChunkEvent::Claude)
                .collect(),
            StreamTransformer::GeminiToOpenAI(state) => state
                .finish()
                .into_iter()
                .map(ChunkEvent::OpenAI)
                .collect(),
        }
    }

    pub fn usage(&self) -> UsageTotals {
        match self {
            StreamTransformer::Passthrough { usage, .. } => *usage,
            StreamTransformer::ClaudeToOpenAI(state) => state.usage(),
            StreamTransformer::OpenAIToClaude(state) => state.usage(),
            StreamTransformer::ClaudeToGemini(state) => state.usage(),
            StreamTransformer::OpenAIToGemini(state) => state.usage(),
            StreamTransformer::GeminiToClaude(state) => state.usage(),
            StreamTransformer::GeminiToOpenAI(state) => state.usage(),
        }
    }
}

fn passthrough_capture(
    proto: Proto,
    event: &ChunkEvent,
    ctx: &StreamContext,
    usage: &mut UsageTotals,
) -> Result<(), TransformError> {
    match (proto, event) {
        (Proto::Claude, ChunkEvent::Claude(event)) => {
            match event {
                StreamEvent::MessageStart { message } => usage.merge(UsageTotals {
                    input_tokens: message.usage.input_tokens,
                    output_tokens: message.usage.output_tokens,
                }),
                StreamEvent::MessageDelta {
                    usage: Some(delta_usage),
                    ..
                } => usage.merge(UsageTotals {
                    input_tokens: delta_usage.input_tokens.unwrap_or(0),
                    output_tokens: delta_usage.output_tokens.unwrap_or(0),
                }),
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::SignatureDelta { signature },
                    ..
                } => ctx.store.store(&ctx.session, signature),
                _ => {}
            }
            Ok(())
        }
        (Proto::OpenAI, ChunkEvent::OpenAI(chunk)) => {
            if let Some(chunk_usage) = &chunk.usage {
                usage.merge(UsageTotals {
                    input_tokens: chunk_usage.prompt_tokens,
                    output_tokens: chunk_usage.completion_tokens,
                });
            }
            for choice in &chunk.choices {
                if let Some(signature) = choice.delta.signature.as_deref() {
                    ctx.store.store(&ctx.session, signature);
                }
            }
            Ok(())
        }
        (Proto::Gemini, ChunkEvent::Gemini(chunk)) => {
            if let Some(chunk_usage) = &chunk.usage_metadata {
                usage.merge(UsageTotals {
                    input_tokens: chunk_usage.prompt_token_count.unwrap_or(0),
                    output_tokens: chunk_usage.candidates_token_count.unwrap_or(0),
                });
            }
            for candidate in &chunk.candidates {
                if let Some(content) = &candidate.content {
                    for part in &content.parts {
                        if let Some(signature) = part.thought_signature.as_deref() {
                            ctx.store.store(&ctx.session, signature);
                        }
                    }
                }
            }
            Ok(())
        }
        _ => Err(TransformError::ProtoMismatch),
    }
}
