//! OpenAI-shaped payloads into Gemini-shaped ones.

pub mod request;
pub mod response;
pub mod stream;
