//! The HTTP ingress: one endpoint per client dialect, all funnelling into the
//! proxy engine.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use anyproxy_core::{ChatCall, EngineResponse, ProxyEngine, ProxyError, RawCall};
use anyproxy_protocol::error::{
    AnthropicErrorEnvelope, GeminiErrorEnvelope, OpenAIErrorEnvelope,
};
use anyproxy_transform::Proto;

/// Ingress hard cap; request bodies are small relative to this.
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

/// Stable `created` for the synthetic model list.
const MODEL_LIST_CREATED: i64 = 1_677_610_602;

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<ProxyEngine>,
}

pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    let state = ProxyState { engine };

    Router::new()
        .route("/api/v1/chat/completions", post(openai_chat_completions))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/completions", post(raw_completions))
        .route("/api/v1/embeddings", post(raw_embeddings))
        .route("/api/anthropic/v1/messages", post(anthropic_messages))
        .route("/api/claudecode/v1/messages", post(anthropic_messages))
        .route("/api/gemini/completions", post(gemini_completions))
        .route(
            "/api/gemini/v1beta/models/{model_action}",
            post(gemini_generate),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_local_credential,
        ))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// The configured local credential is accepted as a bearer token or as
/// `x-api-key`; an empty credential disables the check.
async fn require_local_credential(
    State(state): State<ProxyState>,
    req: Request,
    next: Next,
) -> Response {
    let expected = state.engine.state().config().local_credential.clone();
    if expected.is_empty() {
        return next.run(req).await;
    }

    let presented = extract_credential(req.headers());
    if presented.as_deref() == Some(expected.as_str()) {
        return next.run(req).await;
    }

    let dialect = dialect_for_path(req.uri().path());
    let body = match dialect {
        Proto::OpenAI => serde_json::to_vec(&OpenAIErrorEnvelope::new(
            "authentication_error",
            "invalid or missing credential",
        )),
        Proto::Claude => serde_json::to_vec(&AnthropicErrorEnvelope::new(
            "authentication_error",
            "invalid or missing credential",
        )),
        Proto::Gemini => serde_json::to_vec(&GeminiErrorEnvelope::new(
            401,
            "UNAUTHENTICATED",
            "invalid or missing credential",
        )),
    }
    .unwrap_or_default();

    json_response(StatusCode::UNAUTHORIZED, Bytes::from(body))
}

fn extract_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            let value = value.trim();
            let prefix = "Bearer ";
            if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
                let token = value[prefix.len()..].trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn dialect_for_path(path: &str) -> Proto {
    if path.starts_with("/api/anthropic") || path.starts_with("/api/claudecode") {
        Proto::Claude
    } else if path.starts_with("/api/gemini") {
        Proto::Gemini
    } else {
        Proto::OpenAI
    }
}

// ---- Chat endpoints ----

async fn openai_chat_completions(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_chat(state, Proto::OpenAI, &headers, body, None, false).await
}

async fn anthropic_messages(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_chat(state, Proto::Claude, &headers, body, None, false).await
}

async fn gemini_completions(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_chat(state, Proto::Gemini, &headers, body, None, false).await
}

async fn gemini_generate(
    State(state): State<ProxyState>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(
            Proto::Gemini,
            &ProxyError::BadRequest("expected models/{model}:{action}".to_string()),
        );
    };
    let model = model.trim();
    let force_stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => {
            return error_response(
                Proto::Gemini,
                &ProxyError::BadRequest(format!("unknown action '{action}'")),
            );
        }
    };
    if model.is_empty() {
        return error_response(
            Proto::Gemini,
            &ProxyError::BadRequest("model name is required".to_string()),
        );
    }
    dispatch_chat(
        state,
        Proto::Gemini,
        &headers,
        body,
        Some(model.to_string()),
        force_stream,
    )
    .await
}

async fn dispatch_chat(
    state: ProxyState,
    endpoint: Proto,
    headers: &HeaderMap,
    body: Bytes,
    path_model: Option<String>,
    force_stream: bool,
) -> Response {
    let call = ChatCall {
        endpoint,
        body,
        client_authorization: client_authorization(headers),
        path_model,
        force_stream,
        trace_id: Uuid::new_v4().to_string(),
    };
    match state.engine.handle_chat(call).await {
        Ok(EngineResponse::Json { status, body }) => json_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            body,
        ),
        Ok(EngineResponse::Stream { rx }) => sse_response(rx),
        Err(err) => error_response(endpoint, &err),
    }
}

fn client_authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

// ---- Raw passthrough endpoints ----

async fn raw_completions(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_raw(state, "/v1/completions", &headers, body).await
}

async fn raw_embeddings(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_raw(state, "/v1/embeddings", &headers, body).await
}

async fn dispatch_raw(
    state: ProxyState,
    path: &'static str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let call = RawCall {
        path,
        body,
        client_authorization: client_authorization(headers),
        trace_id: Uuid::new_v4().to_string(),
    };
    match state.engine.handle_raw(call).await {
        Ok(EngineResponse::Json { status, body }) => json_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            body,
        ),
        Ok(EngineResponse::Stream { rx }) => sse_response(rx),
        Err(err) => error_response(Proto::OpenAI, &err),
    }
}

// ---- Models ----

async fn list_models(State(state): State<ProxyState>) -> Response {
    match state.engine.storage().available_models().await {
        Ok(models) => {
            let data: Vec<serde_json::Value> = models
                .into_iter()
                .map(|id| {
                    json!({
                        "id": id,
                        "object": "model",
                        "created": MODEL_LIST_CREATED,
                        "owned_by": "anyproxy",
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({"object": "list", "data": data}))).into_response()
        }
        Err(err) => error_response(
            Proto::OpenAI,
            &ProxyError::Storage(err.to_string()),
        ),
    }
}

// ---- Response assembly ----

fn json_response(status: StatusCode, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Streaming responses flush event-by-event; the extra headers keep
/// intermediaries from buffering the stream.
fn sse_response(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

fn error_response(dialect: Proto, err: &ProxyError) -> Response {
    tracing::warn!(event = "request_failed", error = %err);
    json_response(err.status(), err.body_for(dialect))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_extraction_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-key"));
        assert_eq!(extract_credential(&headers).as_deref(), Some("sk-key"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-bearer"),
        );
        assert_eq!(extract_credential(&headers).as_deref(), Some("sk-bearer"));

        let empty = HeaderMap::new();
        assert!(extract_credential(&empty).is_none());
    }

    #[test]
    fn error_dialect_follows_the_endpoint() {
        assert_eq!(dialect_for_path("/api/v1/chat/completions"), Proto::OpenAI);
        assert_eq!(dialect_for_path("/api/anthropic/v1/messages"), Proto::Claude);
        assert_eq!(dialect_for_path("/api/claudecode/v1/messages"), Proto::Claude);
        assert_eq!(
            dialect_for_path("/api/gemini/v1beta/models/m:generateContent"),
            Proto::Gemini
        );
    }
}
