//! The per-request orchestrator: read, classify, route, transcode, dispatch,
//! retry on signature rejections, and account usage.

use std::sync::Arc;

use bytes::Bytes;
use http::Method;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use anyproxy_common::GlobalConfig;
use anyproxy_storage::{RouteStorage, UsageRecord};
use anyproxy_transform::{
    conversation_fingerprint, cursor, detect_format, middleware, thinking, DetectedFormat, Proto,
    Request, RequestContext, Response, ResponseContext, StreamContext, StreamTransformer,
    TransformError, UsageTotals, DEFAULT_SESSION,
};

use crate::error::ProxyError;
use crate::router::{resolve_route, resolve_route_with_suffix, RouteTarget};
use crate::state::AppState;
use crate::stream::{spawn_stream_pipeline, StreamAccounting};
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamRequest};

const MAX_ERROR_MESSAGE_LEN: usize = 2000;

pub struct ProxyEngine {
    state: Arc<AppState>,
    storage: RouteStorage,
    upstream: Arc<dyn UpstreamClient>,
}

/// One chat request as the ingress router hands it over.
pub struct ChatCall {
    /// Dialect the endpoint implies; responses and errors use this shape.
    pub endpoint: Proto,
    pub body: Bytes,
    /// Client `Authorization` value, passed through when the route carries no
    /// credential of its own.
    pub client_authorization: Option<String>,
    /// Model taken from a Gemini path-style URL, injected into the body.
    pub path_model: Option<String>,
    /// Set by the `:streamGenerateContent` endpoint regardless of the body.
    pub force_stream: bool,
    pub trace_id: String,
}

/// A verbatim passthrough request (completions, embeddings): routed by model
/// but never transcoded.
pub struct RawCall {
    pub path: &'static str,
    pub body: Bytes,
    pub client_authorization: Option<String>,
    pub trace_id: String,
}

#[derive(Debug)]
pub enum EngineResponse {
    Json { status: u16, body: Bytes },
    Stream { rx: mpsc::Receiver<Bytes> },
}

impl ProxyEngine {
    pub fn new(
        state: Arc<AppState>,
        storage: RouteStorage,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            state,
            storage,
            upstream,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn storage(&self) -> &RouteStorage {
        &self.storage
    }

    pub async fn handle_chat(&self, call: ChatCall) -> Result<EngineResponse, ProxyError> {
        let config = self.state.config();

        let mut value: Value = serde_json::from_slice(&call.body)
            .map_err(|err| ProxyError::BadRequest(format!("invalid JSON body: {err}")))?;
        if !value.is_object() {
            return Err(ProxyError::BadRequest(
                "request body must be a JSON object".to_string(),
            ));
        }
        if let Some(path_model) = &call.path_model {
            value["model"] = Value::String(path_model.clone());
        }

        let (client_model, model) = resolve_model(&config, &mut value)?;
        let session =
            conversation_fingerprint(&value).unwrap_or_else(|| DEFAULT_SESSION.to_string());

        let detected = detect_format(&value, call.endpoint);
        info!(
            event = "request_classified",
            trace_id = %call.trace_id,
            format = ?detected,
            model = %model,
            session = %session
        );
        if detected == DetectedFormat::CursorMixed {
            value = cursor::normalize_cursor_body(value, &self.state.signatures, &session);
        }
        let src = detected.proto();

        let stream = call.force_stream
            || value
                .get("stream")
                .and_then(Value::as_bool)
                .unwrap_or(false);

        let route = resolve_route(&self.storage, &model, stream).await?;
        info!(
            event = "route_resolved",
            trace_id = %call.trace_id,
            route = %route.display_name,
            url = %route.url,
            upstream_format = route.proto.as_str(),
            is_stream = stream
        );

        let request = decode_request(src, value)?;
        let upstream_request = {
            let ctx = RequestContext {
                target_model: &route.model,
                session: &session,
                store: &self.state.signatures,
                stream,
            };
            middleware::transform_request(src, route.proto, request, &ctx)?
        };

        self.dispatch(call, route, upstream_request, stream, session, client_model)
            .await
    }

    async fn dispatch(
        &self,
        call: ChatCall,
        route: RouteTarget,
        mut request: Request,
        stream: bool,
        session: String,
        client_model: String,
    ) -> Result<EngineResponse, ProxyError> {
        let mut demoted_thinking = false;
        let mut stripped_tool_signatures = false;

        loop {
            let body = encode_request(&request)?;
            let headers = build_headers(
                route.proto,
                route.credential.as_deref(),
                call.client_authorization.as_deref(),
            );
            let sent = self
                .upstream
                .send(UpstreamRequest {
                    method: Method::POST,
                    url: route.url.clone(),
                    headers,
                    body: Some(body),
                    is_stream: stream,
                })
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    self.log_usage(
                        &client_model,
                        route.route_id,
                        UsageTotals::default(),
                        false,
                        Some(err.message.clone()),
                    )
                    .await;
                    return Err(ProxyError::UpstreamUnavailable(err.message));
                }
            };

            if !(200..300).contains(&response.status) {
                let body = collect_body(response.body).await;
                let text = String::from_utf8_lossy(&body).to_string();

                if response.status == 400 && references_signature(&text) {
                    if !demoted_thinking {
                        demoted_thinking = true;
                        warn!(
                            event = "signature_retry",
                            trace_id = %call.trace_id,
                            stage = "demote_thinking"
                        );
                        thinking::demote_thinking(&mut request);
                        continue;
                    }
                    if !stripped_tool_signatures && references_tools(&text) {
                        stripped_tool_signatures = true;
                        warn!(
                            event = "signature_retry",
                            trace_id = %call.trace_id,
                            stage = "strip_tool_signatures"
                        );
                        thinking::strip_tool_signatures(&mut request);
                        continue;
                    }
                }

                self.log_usage(
                    &client_model,
                    route.route_id,
                    UsageTotals::default(),
                    false,
                    Some(text),
                )
                .await;
                return Err(ProxyError::UpstreamError {
                    status: response.status,
                    body,
                });
            }

            if stream {
                let upstream_rx = into_stream(response.body);
                let transformer = StreamTransformer::new(
                    route.proto,
                    call.endpoint,
                    StreamContext {
                        client_model: client_model.clone(),
                        session: session.clone(),
                        store: self.state.signatures.clone(),
                    },
                );
                let rx = spawn_stream_pipeline(
                    route.proto,
                    call.endpoint,
                    transformer,
                    upstream_rx,
                    Some(StreamAccounting {
                        storage: self.storage.clone(),
                        model: client_model,
                        route_id: route.route_id,
                    }),
                    call.trace_id,
                );
                return Ok(EngineResponse::Stream { rx });
            }

            let body = collect_body(response.body).await;
            let upstream_response = decode_response(route.proto, &body)?;
            let usage = middleware::response_usage(&upstream_response);
            let client_response = {
                let ctx = ResponseContext {
                    client_model: &client_model,
                    session: &session,
                    store: &self.state.signatures,
                };
                middleware::transform_response(route.proto, call.endpoint, upstream_response, &ctx)?
            };
            let out = encode_response(&client_response)?;
            self.log_usage(&client_model, route.route_id, usage, true, None)
                .await;
            return Ok(EngineResponse::Json {
                status: response.status,
                body: out,
            });
        }
    }

    /// Forward a body verbatim to the routed upstream; used for the OpenAI
    /// endpoints the proxy does not transcode.
    pub async fn handle_raw(&self, call: RawCall) -> Result<EngineResponse, ProxyError> {
        let config = self.state.config();
        let mut value: Value = serde_json::from_slice(&call.body)
            .map_err(|err| ProxyError::BadRequest(format!("invalid JSON body: {err}")))?;
        let (client_model, model) = resolve_model(&config, &mut value)?;

        let route = resolve_route_with_suffix(&self.storage, &model, call.path).await?;
        let body = serde_json::to_vec(&value)
            .map_err(|err| TransformError::malformed("request", err.to_string()))?;
        let headers = build_headers(
            Proto::OpenAI,
            route.credential.as_deref(),
            call.client_authorization.as_deref(),
        );

        let response = self
            .upstream
            .send(UpstreamRequest {
                method: Method::POST,
                url: route.url.clone(),
                headers,
                body: Some(Bytes::from(body)),
                is_stream: false,
            })
            .await
            .map_err(|err| ProxyError::UpstreamUnavailable(err.message))?;

        let status = response.status;
        let body = collect_body(response.body).await;
        let success = (200..300).contains(&status);
        let usage = if success {
            extract_openai_usage(&body)
        } else {
            UsageTotals::default()
        };
        self.log_usage(
            &client_model,
            route.route_id,
            usage,
            success,
            (!success).then(|| String::from_utf8_lossy(&body).to_string()),
        )
        .await;

        if success {
            Ok(EngineResponse::Json { status, body })
        } else {
            Err(ProxyError::UpstreamError { status, body })
        }
    }

    /// Ask an upstream for its `/v1/models` list; used by the management
    /// surface when filling in route records.
    pub async fn fetch_remote_models(
        &self,
        api_url: &str,
        api_key: Option<&str>,
    ) -> Result<Vec<String>, ProxyError> {
        let base = api_url.trim().strip_suffix('/').unwrap_or(api_url.trim());
        let base = if base.starts_with("http://") || base.starts_with("https://") {
            base.to_string()
        } else {
            format!("https://{base}")
        };
        let url = format!("{base}/v1/models");

        let mut headers = Vec::new();
        if let Some(key) = api_key.filter(|key| !key.is_empty()) {
            headers.push(("authorization".to_string(), format!("Bearer {key}")));
        }

        let response = self
            .upstream
            .send(UpstreamRequest {
                method: Method::GET,
                url,
                headers,
                body: None,
                is_stream: false,
            })
            .await
            .map_err(|err| ProxyError::UpstreamUnavailable(err.message))?;

        let status = response.status;
        let body = collect_body(response.body).await;
        if !(200..300).contains(&status) {
            return Err(ProxyError::UpstreamError { status, body });
        }

        let value: Value = serde_json::from_slice(&body)
            .map_err(|err| ProxyError::BadRequest(format!("unparseable model list: {err}")))?;
        let models = value
            .get("data")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("id").and_then(Value::as_str))
                    .map(|id| id.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn log_usage(
        &self,
        model: &str,
        route_id: i64,
        usage: UsageTotals,
        success: bool,
        error_message: Option<String>,
    ) {
        let record = UsageRecord {
            model: model.to_string(),
            route_id,
            prompt_tokens: usage.input_tokens as i64,
            completion_tokens: usage.output_tokens as i64,
            total_tokens: usage.total() as i64,
            success,
            error_message: error_message.map(truncate_message),
        };
        if let Err(err) = self.storage.record_usage(record).await {
            warn!(event = "usage_log_failed", error = %err);
        }
    }
}

/// Apply the redirect keyword and return `(client-visible model, routed
/// model)`. The usage log always records the client-visible name.
fn resolve_model(
    config: &GlobalConfig,
    value: &mut Value,
) -> Result<(String, String), ProxyError> {
    let requested = value
        .get("model")
        .and_then(Value::as_str)
        .filter(|model| !model.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("'model' field is required".to_string()))?
        .to_string();

    let mut model = requested.clone();
    if config.redirect_enabled && model == config.redirect_keyword {
        if config.redirect_target_model.is_empty() {
            return Err(ProxyError::BadRequest(
                "redirect target model not configured".to_string(),
            ));
        }
        info!(
            event = "redirect_applied",
            keyword = %model,
            target = %config.redirect_target_model
        );
        model = config.redirect_target_model.clone();
        value["model"] = Value::String(model.clone());
    }

    Ok((requested, model))
}

fn decode_request(proto: Proto, value: Value) -> Result<Request, ProxyError> {
    let decoded = match proto {
        Proto::OpenAI => serde_json::from_value(value).map(Request::OpenAI),
        Proto::Claude => serde_json::from_value(value).map(Request::Claude),
        Proto::Gemini => serde_json::from_value(value).map(Request::Gemini),
    };
    decoded.map_err(|err| ProxyError::BadRequest(format!("invalid request shape: {err}")))
}

fn encode_request(request: &Request) -> Result<Bytes, ProxyError> {
    let encoded = match request {
        Request::OpenAI(body) => serde_json::to_vec(body),
        Request::Claude(body) => serde_json::to_vec(body),
        Request::Gemini(body) => serde_json::to_vec(body),
    };
    encoded
        .map(Bytes::from)
        .map_err(|err| TransformError::malformed("request", err.to_string()).into())
}

fn decode_response(proto: Proto, body: &Bytes) -> Result<Response, ProxyError> {
    let decoded = match proto {
        Proto::OpenAI => serde_json::from_slice(body).map(Response::OpenAI),
        Proto::Claude => serde_json::from_slice(body).map(Response::Claude),
        Proto::Gemini => serde_json::from_slice(body).map(Response::Gemini),
    };
    decoded.map_err(|err| TransformError::malformed("upstream response", err.to_string()).into())
}

fn encode_response(response: &Response) -> Result<Bytes, ProxyError> {
    let encoded = match response {
        Response::OpenAI(body) => serde_json::to_vec(body),
        Response::Claude(body) => serde_json::to_vec(body),
        Response::Gemini(body) => serde_json::to_vec(body),
    };
    encoded
        .map(Bytes::from)
        .map_err(|err| TransformError::malformed("response", err.to_string()).into())
}

fn build_headers(
    proto: Proto,
    credential: Option<&str>,
    client_authorization: Option<&str>,
) -> Vec<(String, String)> {
    let mut headers = vec![(
        "content-type".to_string(),
        "application/json".to_string(),
    )];
    if proto == Proto::Claude {
        headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
    }

    if let Some(credential) = credential {
        match proto {
            Proto::OpenAI => {
                headers.push(("authorization".to_string(), format!("Bearer {credential}")));
            }
            Proto::Claude => {
                headers.push(("x-api-key".to_string(), credential.to_string()));
                headers.push(("authorization".to_string(), format!("Bearer {credential}")));
            }
            Proto::Gemini => {
                headers.push(("x-goog-api-key".to_string(), credential.to_string()));
            }
        }
    } else if let Some(authorization) = client_authorization {
        headers.push(("authorization".to_string(), authorization.to_string()));
    }

    headers
}

async fn collect_body(body: UpstreamBody) -> Bytes {
    match body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            Bytes::from(out)
        }
    }
}

fn into_stream(body: UpstreamBody) -> mpsc::Receiver<Bytes> {
    match body {
        UpstreamBody::Stream(rx) => rx,
        UpstreamBody::Bytes(bytes) => {
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(bytes);
            rx
        }
    }
}

fn references_signature(text: &str) -> bool {
    text.contains("thought_signature") || text.to_ascii_lowercase().contains("signature")
}

fn references_tools(text: &str) -> bool {
    text.to_ascii_lowercase().contains("tool")
}

fn extract_openai_usage(body: &Bytes) -> UsageTotals {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return UsageTotals::default();
    };
    let Some(usage) = value.get("usage") else {
        return UsageTotals::default();
    };
    UsageTotals {
        input_tokens: usage
            .get("prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        output_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    }
}

fn truncate_message(message: String) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
