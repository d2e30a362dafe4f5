use std::sync::Arc;

use anyproxy_protocol::claude;
use anyproxy_protocol::gemini;
use anyproxy_protocol::openai;

use crate::signature::SignatureStore;

/// The three wire protocols the proxy speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    OpenAI,
    Claude,
    Gemini,
}

impl Proto {
    /// Route `format_tag` values as stored in the route table.
    pub fn from_format_tag(tag: &str) -> Option<Proto> {
        match tag {
            "openai" | "" => Some(Proto::OpenAI),
            "anthropic" => Some(Proto::Claude),
            "gemini" => Some(Proto::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::OpenAI => "openai",
            Proto::Claude => "anthropic",
            Proto::Gemini => "gemini",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("unsupported transform {src:?} -> {dst:?}")]
    UnsupportedPair { src: Proto, dst: Proto },
    #[error("stream event does not match the expected protocol")]
    ProtoMismatch,
    #[error("malformed {context} payload: {detail}")]
    Malformed {
        context: &'static str,
        detail: String,
    },
}

impl TransformError {
    pub fn malformed(context: &'static str, detail: impl Into<String>) -> Self {
        TransformError::Malformed {
            context,
            detail: detail.into(),
        }
    }
}

/// A decoded request body in one of the three native shapes.
#[derive(Debug, Clone)]
pub enum Request {
    OpenAI(openai::ChatCompletionRequestBody),
    Claude(claude::CreateMessageRequestBody),
    Gemini(gemini::GenerateContentRequestBody),
}

impl Request {
    pub fn proto(&self) -> Proto {
        match self {
            Request::OpenAI(_) => Proto::OpenAI,
            Request::Claude(_) => Proto::Claude,
            Request::Gemini(_) => Proto::Gemini,
        }
    }
}

/// A decoded non-streaming response body.
#[derive(Debug, Clone)]
pub enum Response {
    OpenAI(openai::ChatCompletionResponse),
    Claude(claude::Message),
    Gemini(gemini::GenerateContentResponse),
}

impl Response {
    pub fn proto(&self) -> Proto {
        match self {
            Response::OpenAI(_) => Proto::OpenAI,
            Response::Claude(_) => Proto::Claude,
            Response::Gemini(_) => Proto::Gemini,
        }
    }
}

/// One decoded streaming event in either dialect. Gemini streams whole
/// `GenerateContentResponse` objects per SSE line.
#[derive(Debug, Clone)]
pub enum ChunkEvent {
    OpenAI(openai::ChatCompletionChunk),
    Claude(claude::StreamEvent),
    Gemini(gemini::GenerateContentResponse),
}

/// Token totals extracted from response/stream payloads for the usage log.
/// Missing fields stay at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl UsageTotals {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn merge(&mut self, other: UsageTotals) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
    }
}

/// Context for the request leg (client shape -> upstream shape).
pub struct RequestContext<'a> {
    /// Logical model of the resolved route; the upstream body carries this.
    pub target_model: &'a str,
    /// Conversation fingerprint keying the signature store.
    pub session: &'a str,
    pub store: &'a SignatureStore,
    pub stream: bool,
}

/// Context for the response leg (upstream shape -> client shape).
pub struct ResponseContext<'a> {
    /// Model name the client asked for; response bodies echo it back.
    pub client_model: &'a str,
    pub session: &'a str,
    pub store: &'a SignatureStore,
}

/// Context owned by streaming transformers for the lifetime of one request.
#[derive(Clone)]
pub struct StreamContext {
    pub client_model: String,
    pub session: String,
    pub store: Arc<SignatureStore>,
}
