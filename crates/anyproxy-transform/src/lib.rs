//! Protocol transcoding between OpenAI Chat Completions, Anthropic Messages
//! and Gemini generateContent, plus the supporting pieces: format detection,
//! schema sanitizing, the thought-signature store and the thinking filter.
//!
//! Each directional module `{src}2{dst}` converts `src`-shaped payloads into
//! `dst`-shaped ones: `request.rs` for request bodies, `response.rs` for
//! non-streaming responses, `stream.rs` for streaming chunks. A proxy flow
//! with client protocol A and upstream protocol B uses `a2b::request` on the
//! way out and `b2a::{response,stream}` on the way back.

pub mod cursor;
pub mod detect;
pub mod helpers;
pub mod middleware;
pub mod schema;
pub mod signature;
pub mod thinking;
pub mod types;

pub mod claude2gemini;
pub mod claude2openai;
pub mod gemini2claude;
pub mod gemini2openai;
pub mod openai2claude;
pub mod openai2gemini;

pub use detect::{detect_format, DetectedFormat};
pub use middleware::{transform_request, transform_response, StreamTransformer};
pub use signature::{conversation_fingerprint, SignatureStore, DEFAULT_SESSION, MIN_SIGNATURE_LEN};
pub use types::{
    ChunkEvent, Proto, Request, RequestContext, Response, ResponseContext, StreamContext,
    TransformError, UsageTotals,
};
