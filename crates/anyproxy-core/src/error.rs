use bytes::Bytes;
use http::StatusCode;
use serde_json::Value;

use anyproxy_protocol::error::{
    AnthropicErrorEnvelope, GeminiErrorEnvelope, OpenAIErrorEnvelope,
};
use anyproxy_transform::{Proto, TransformError};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("model '{model}' not found in route list")]
    ModelNotFound { model: String, available: Vec<String> },
    #[error("backend service unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream returned status {status}")]
    UpstreamError { status: u16, body: Bytes },
    #[error("transcode failed: {0}")]
    Transcode(#[from] TransformError),
    #[error("request cancelled by client")]
    Cancelled,
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Transcode(_) | ProxyError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Cancelled => StatusCode::BAD_REQUEST,
        }
    }

    /// Render the failure in the dialect of the endpoint it arrived at.
    pub fn body_for(&self, dialect: Proto) -> Bytes {
        if let ProxyError::UpstreamError { status, body } = self {
            return shape_upstream_error(dialect, *status, body);
        }
        let message = self.to_string();
        let kind = match self {
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::ModelNotFound { .. } => "not_found_error",
            ProxyError::UpstreamUnavailable(_) => "overloaded_error",
            ProxyError::Transcode(_) => "transcode_error",
            ProxyError::Cancelled => "cancelled",
            ProxyError::UpstreamError { .. } => unreachable!("handled above"),
            ProxyError::Storage(_) => "api_error",
        };
        let message = match self {
            ProxyError::ModelNotFound { model, available } => format!(
                "model '{}' not found in route list. Available models: [{}]",
                model,
                available.join(", ")
            ),
            _ => message,
        };
        encode_error(dialect, self.status(), kind, &message)
    }
}

fn encode_error(dialect: Proto, status: StatusCode, kind: &str, message: &str) -> Bytes {
    let value = match dialect {
        Proto::OpenAI => serde_json::to_vec(&OpenAIErrorEnvelope::new(kind, message)),
        Proto::Claude => serde_json::to_vec(&AnthropicErrorEnvelope::new(kind, message)),
        Proto::Gemini => serde_json::to_vec(&GeminiErrorEnvelope::new(
            status.as_u16(),
            gemini_status(status),
            message,
        )),
    };
    value.map(Bytes::from).unwrap_or_else(|_| Bytes::from_static(b"{}"))
}

fn gemini_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "INVALID_ARGUMENT",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::SERVICE_UNAVAILABLE => "UNAVAILABLE",
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "PERMISSION_DENIED",
        _ => "INTERNAL",
    }
}

/// Upstream failure bodies are forwarded; a body already carrying an error
/// envelope passes through as-is, anything else is wrapped in the client
/// dialect.
fn shape_upstream_error(dialect: Proto, status: u16, body: &Bytes) -> Bytes {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        let already_shaped = match dialect {
            Proto::OpenAI | Proto::Gemini => value.get("error").is_some(),
            Proto::Claude => value.get("type").and_then(Value::as_str) == Some("error"),
        };
        if already_shaped {
            return body.clone();
        }
        if let Some(message) = upstream_error_message(&value) {
            return encode_error(
                dialect,
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                "upstream_error",
                &message,
            );
        }
    }
    encode_error(
        dialect,
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
        "upstream_error",
        &String::from_utf8_lossy(body),
    )
}

/// Dig the human-readable message out of whichever error envelope the
/// upstream used.
pub fn upstream_error_message(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    error.as_str().map(|message| message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_not_found_lists_available_models() {
        let err = ProxyError::ModelNotFound {
            model: "gpt-9".into(),
            available: vec!["gpt-4o-mini".into(), "claude-3-5-haiku".into()],
        };
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let body = err.body_for(Proto::OpenAI);
        let value: Value = serde_json::from_slice(&body).unwrap();
        let message = value["error"]["message"].as_str().unwrap();
        assert!(message.contains("gpt-4o-mini"));
        assert!(message.contains("claude-3-5-haiku"));
    }

    #[test]
    fn each_dialect_gets_its_own_envelope() {
        let err = ProxyError::BadRequest("'model' field is required".into());
        let openai: Value = serde_json::from_slice(&err.body_for(Proto::OpenAI)).unwrap();
        assert_eq!(openai["error"]["type"], "invalid_request_error");

        let anthropic: Value = serde_json::from_slice(&err.body_for(Proto::Claude)).unwrap();
        assert_eq!(anthropic["type"], "error");
        assert_eq!(anthropic["error"]["type"], "invalid_request_error");

        let gemini: Value = serde_json::from_slice(&err.body_for(Proto::Gemini)).unwrap();
        assert_eq!(gemini["error"]["code"], 400);
        assert_eq!(gemini["error"]["status"], "INVALID_ARGUMENT");
    }

    #[test]
    fn shaped_upstream_errors_pass_through() {
        let body = Bytes::from_static(br#"{"error":{"message":"rate limited","type":"rate_limit"}}"#);
        let err = ProxyError::UpstreamError { status: 429, body };
        let out = err.body_for(Proto::OpenAI);
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["error"]["message"], "rate limited");
    }

    #[test]
    fn unshaped_upstream_errors_are_wrapped_in_the_client_dialect() {
        let body = Bytes::from_static(br#"{"error":{"message":"boom"}}"#);
        let err = ProxyError::UpstreamError { status: 500, body };
        let out = err.body_for(Proto::Claude);
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["message"], "boom");
    }
}
