//! End-to-end engine scenarios against an in-process mock upstream.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};

use anyproxy_common::GlobalConfig;
use anyproxy_core::{
    AppState, ChatCall, EngineResponse, ProxyEngine, ProxyError, UpstreamBody, UpstreamClient,
    UpstreamFailure, UpstreamRequest, UpstreamResponse,
};
use anyproxy_storage::{RouteInput, RouteStorage};
use anyproxy_transform::{conversation_fingerprint, Proto};

#[derive(Debug, Clone)]
struct CapturedRequest {
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Value>,
}

enum MockReply {
    Json { status: u16, body: String },
    Stream { frames: Vec<String> },
}

struct MockUpstream {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CapturedRequest>>,
}

impl MockUpstream {
    fn new(replies: Vec<MockReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn captured(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl UpstreamClient for MockUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.requests.lock().unwrap().push(CapturedRequest {
                url: req.url.clone(),
                headers: req.headers.clone(),
                body: req
                    .body
                    .as_ref()
                    .and_then(|body| serde_json::from_slice(body).ok()),
            });
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| UpstreamFailure {
                    message: "mock exhausted".to_string(),
                })?;
            Ok(match reply {
                MockReply::Json { status, body } => UpstreamResponse {
                    status,
                    headers: vec![("content-type".into(), "application/json".into())],
                    body: UpstreamBody::Bytes(Bytes::from(body)),
                },
                MockReply::Stream { frames } => {
                    let (tx, rx) = tokio::sync::mpsc::channel(16);
                    tokio::spawn(async move {
                        for frame in frames {
                            if tx.send(Bytes::from(frame)).await.is_err() {
                                break;
                            }
                        }
                    });
                    UpstreamResponse {
                        status: 200,
                        headers: vec![(
                            "content-type".into(),
                            "text/event-stream".into(),
                        )],
                        body: UpstreamBody::Stream(rx),
                    }
                }
            })
        })
    }
}

fn test_config() -> GlobalConfig {
    GlobalConfig {
        bind_host: "127.0.0.1".into(),
        bind_port: 0,
        local_credential: String::new(),
        database_path: ":memory:".into(),
        redirect_enabled: false,
        redirect_keyword: "proxy_auto".into(),
        redirect_target_model: String::new(),
    }
}

async fn engine_with(
    routes: Vec<RouteInput>,
    upstream: Arc<MockUpstream>,
    config: GlobalConfig,
) -> (ProxyEngine, RouteStorage) {
    let storage = RouteStorage::connect_in_memory().await.unwrap();
    storage.sync_schema().await.unwrap();
    for route in routes {
        storage.insert_route(route).await.unwrap();
    }
    let state = Arc::new(AppState::new(config));
    let engine = ProxyEngine::new(state, storage.clone(), upstream);
    (engine, storage)
}

fn route(model: &str, format_tag: &str) -> RouteInput {
    RouteInput {
        display_name: format!("{model} upstream"),
        logical_model: model.into(),
        upstream_url: "https://upstream.test/".into(),
        credential: Some("sk-upstream".into()),
        group_name: None,
        format_tag: format_tag.into(),
        enabled: true,
    }
}

fn chat_call(endpoint: Proto, body: Value) -> ChatCall {
    ChatCall {
        endpoint,
        body: Bytes::from(body.to_string()),
        client_authorization: None,
        path_model: None,
        force_stream: false,
        trace_id: "trace-test".into(),
    }
}

async fn json_response(response: EngineResponse) -> Value {
    match response {
        EngineResponse::Json { body, .. } => serde_json::from_slice(&body).unwrap(),
        EngineResponse::Stream { .. } => panic!("expected a JSON response"),
    }
}

async fn drain_stream(response: EngineResponse) -> String {
    match response {
        EngineResponse::Stream { mut rx } => {
            let mut out = String::new();
            while let Some(chunk) = rx.recv().await {
                out.push_str(&String::from_utf8_lossy(&chunk));
            }
            out
        }
        EngineResponse::Json { .. } => panic!("expected a streaming response"),
    }
}

// S1: Anthropic-shaped client, OpenAI upstream, minimal passthrough.
#[tokio::test]
async fn anthropic_client_openai_upstream_passthrough() {
    let upstream = MockUpstream::new(vec![MockReply::Json {
        status: 200,
        body: json!({
            "id": "chatcmpl-s1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "pong"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
        })
        .to_string(),
    }]);
    let (engine, storage) = engine_with(
        vec![route("gpt-4o-mini", "openai")],
        upstream.clone(),
        test_config(),
    )
    .await;

    let body = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "ping"}],
        "max_tokens": 16
    });
    let response = engine
        .handle_chat(chat_call(Proto::Claude, body))
        .await
        .unwrap();
    let value = json_response(response).await;

    assert_eq!(value["type"], "message");
    assert_eq!(value["role"], "assistant");
    assert_eq!(value["content"][0]["type"], "text");
    assert_eq!(value["content"][0]["text"], "pong");
    assert_eq!(value["stop_reason"], "end_turn");
    assert_eq!(value["usage"]["input_tokens"], 2);
    assert_eq!(value["usage"]["output_tokens"], 1);

    let captured = upstream.captured();
    assert_eq!(captured[0].url, "https://upstream.test/v1/chat/completions");
    assert!(captured[0]
        .headers
        .iter()
        .any(|(name, value)| name == "authorization" && value == "Bearer sk-upstream"));

    let rows = storage.recent_usage(5).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
    assert_eq!(rows[0].total_tokens, 3);
}

// S3: tool definitions and results survive the OpenAI -> Anthropic round trip.
#[tokio::test]
async fn tool_use_round_trip_across_protocols() {
    let upstream = MockUpstream::new(vec![
        MockReply::Json {
            status: 200,
            body: json!({
                "id": "msg_a",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-sonnet",
                "content": [{
                    "type": "tool_use",
                    "id": "toolu_01",
                    "name": "get_time",
                    "input": {"tz": "UTC"}
                }],
                "stop_reason": "tool_use",
                "stop_sequence": null,
                "usage": {"input_tokens": 10, "output_tokens": 4}
            })
            .to_string(),
        },
        MockReply::Json {
            status: 200,
            body: json!({
                "id": "msg_b",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-sonnet",
                "content": [{"type": "text", "text": "It is noon."}],
                "stop_reason": "end_turn",
                "stop_sequence": null,
                "usage": {"input_tokens": 20, "output_tokens": 5}
            })
            .to_string(),
        },
    ]);
    let (engine, _storage) = engine_with(
        vec![route("claude-3-5-sonnet", "anthropic")],
        upstream.clone(),
        test_config(),
    )
    .await;

    // Turn A.
    let body = json!({
        "model": "claude-3-5-sonnet",
        "messages": [{"role": "user", "content": "what time is it?"}],
        "tools": [{
            "type": "function",
            "function": {
                "name": "get_time",
                "parameters": {
                    "type": "object",
                    "properties": {"tz": {"type": "string"}},
                    "required": ["tz"]
                }
            }
        }]
    });
    let response = engine
        .handle_chat(chat_call(Proto::OpenAI, body))
        .await
        .unwrap();
    let value = json_response(response).await;

    let call = &value["choices"][0]["message"]["tool_calls"][0];
    assert_eq!(call["id"], "toolu_01");
    assert_eq!(call["function"]["name"], "get_time");
    assert_eq!(
        serde_json::from_str::<Value>(call["function"]["arguments"].as_str().unwrap()).unwrap(),
        json!({"tz": "UTC"})
    );
    assert_eq!(value["choices"][0]["finish_reason"], "tool_calls");

    let captured = upstream.captured();
    let sent = captured[0].body.as_ref().unwrap();
    assert_eq!(sent["tools"][0]["name"], "get_time");
    assert_eq!(sent["tools"][0]["description"], "");
    assert_eq!(sent["tools"][0]["input_schema"]["required"][0], "tz");
    assert_eq!(captured[0].url, "https://upstream.test/v1/messages");
    assert!(captured[0]
        .headers
        .iter()
        .any(|(name, value)| name == "anthropic-version" && value == "2023-06-01"));

    // Turn B: the tool reply goes back upstream as a tool_result block.
    let body = json!({
        "model": "claude-3-5-sonnet",
        "messages": [
            {"role": "user", "content": "what time is it?"},
            {"role": "assistant", "tool_calls": [{
                "id": "toolu_01",
                "type": "function",
                "function": {"name": "get_time", "arguments": "{\"tz\":\"UTC\"}"}
            }]},
            {"role": "tool", "tool_call_id": "toolu_01", "content": "12:00Z"}
        ]
    });
    engine
        .handle_chat(chat_call(Proto::OpenAI, body))
        .await
        .unwrap();

    let captured = upstream.captured();
    let sent = captured[1].body.as_ref().unwrap();
    let messages = sent["messages"].as_array().unwrap();
    let assistant = &messages[1];
    assert_eq!(assistant["role"], "assistant");
    assert_eq!(assistant["content"][0]["type"], "tool_use");
    assert_eq!(assistant["content"][0]["id"], "toolu_01");
    let user = &messages[2];
    assert_eq!(user["role"], "user");
    assert_eq!(user["content"][0]["type"], "tool_result");
    assert_eq!(user["content"][0]["tool_use_id"], "toolu_01");
    assert_eq!(user["content"][0]["content"], "12:00Z");
}

// S4: the redirect keyword routes to the target model but the usage log
// keeps the client-visible name.
#[tokio::test]
async fn redirect_keyword_resolves_but_logs_the_original_model() {
    let upstream = MockUpstream::new(vec![MockReply::Json {
        status: 200,
        body: json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "claude-3-5-haiku",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "ok"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        })
        .to_string(),
    }]);
    let mut config = test_config();
    config.redirect_enabled = true;
    config.redirect_target_model = "claude-3-5-haiku".into();
    let (engine, storage) = engine_with(
        vec![route("claude-3-5-haiku", "openai")],
        upstream.clone(),
        config,
    )
    .await;

    let body = json!({
        "model": "proxy_auto",
        "messages": [{"role": "user", "content": "hi"}]
    });
    engine
        .handle_chat(chat_call(Proto::OpenAI, body))
        .await
        .unwrap();

    let captured = upstream.captured();
    assert_eq!(captured[0].body.as_ref().unwrap()["model"], "claude-3-5-haiku");

    let rows = storage.recent_usage(5).await.unwrap();
    assert_eq!(rows[0].model, "proxy_auto");
}

// S5: a 400 naming the signature triggers one degradation pass and the
// second attempt succeeds.
#[tokio::test]
async fn signature_error_demotes_thinking_and_retries() {
    let upstream = MockUpstream::new(vec![
        MockReply::Json {
            status: 400,
            body: json!({
                "type": "error",
                "error": {"type": "invalid_request_error", "message": "thought_signature invalid"}
            })
            .to_string(),
        },
        MockReply::Json {
            status: 200,
            body: json!({
                "id": "msg_ok",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-sonnet",
                "content": [{"type": "text", "text": "recovered"}],
                "stop_reason": "end_turn",
                "stop_sequence": null,
                "usage": {"input_tokens": 5, "output_tokens": 2}
            })
            .to_string(),
        },
    ]);
    let (engine, _storage) = engine_with(
        vec![route("claude-3-5-sonnet", "anthropic")],
        upstream.clone(),
        test_config(),
    )
    .await;

    let body = json!({
        "model": "claude-3-5-sonnet",
        "max_tokens": 64,
        "messages": [
            {"role": "user", "content": "continue"},
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "earlier trace", "signature": "s".repeat(60)},
                {"type": "text", "text": "partial"}
            ]},
            {"role": "user", "content": "go on"}
        ]
    });
    let response = engine
        .handle_chat(chat_call(Proto::Claude, body))
        .await
        .unwrap();
    let value = json_response(response).await;
    assert_eq!(value["content"][0]["text"], "recovered");

    let captured = upstream.captured();
    assert_eq!(captured.len(), 2);
    let retried = captured[1].body.as_ref().unwrap();
    let blocks = retried["messages"][1]["content"].as_array().unwrap();
    assert!(blocks
        .iter()
        .all(|block| block["type"].as_str() != Some("thinking")));
    assert!(retried.get("thinking").is_none());
}

// S2: Anthropic upstream streamed into an OpenAI client, reasoning included.
#[tokio::test]
async fn streaming_anthropic_to_openai_with_reasoning() {
    let signature = format!("SIG_{}", "A".repeat(56));
    let frames = vec![
        format!(
            "event: message_start\ndata: {}\n\n",
            json!({
                "type": "message_start",
                "message": {
                    "id": "msg_s2",
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": "claude-3-5-sonnet",
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 4, "output_tokens": 0}
                }
            })
        ),
        format!(
            "event: content_block_start\ndata: {}\n\n",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "thinking", "thinking": ""}
            })
        ),
        format!(
            "event: content_block_delta\ndata: {}\n\n",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "thinking_delta", "thinking": "because"}
            })
        ),
        format!(
            "event: content_block_delta\ndata: {}\n\n",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "signature_delta", "signature": signature}
            })
        ),
        format!(
            "event: content_block_stop\ndata: {}\n\n",
            json!({"type": "content_block_stop", "index": 0})
        ),
        format!(
            "event: content_block_start\ndata: {}\n\n",
            json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "text", "text": ""}
            })
        ),
        format!(
            "event: content_block_delta\ndata: {}\n\n",
            json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": {"type": "text_delta", "text": "done"}
            })
        ),
        format!(
            "event: content_block_stop\ndata: {}\n\n",
            json!({"type": "content_block_stop", "index": 1})
        ),
        format!(
            "event: message_delta\ndata: {}\n\n",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"input_tokens": 4, "output_tokens": 2}
            })
        ),
        format!(
            "event: message_stop\ndata: {}\n\n",
            json!({"type": "message_stop"})
        ),
    ];
    let upstream = MockUpstream::new(vec![MockReply::Stream { frames }]);
    let (engine, storage) = engine_with(
        vec![route("claude-3-5-sonnet", "anthropic")],
        upstream.clone(),
        test_config(),
    )
    .await;

    let body = json!({
        "model": "claude-3-5-sonnet",
        "stream": true,
        "messages": [{"role": "user", "content": "Why?"}]
    });
    let fingerprint = conversation_fingerprint(&body).unwrap();
    let response = engine
        .handle_chat(chat_call(Proto::OpenAI, body))
        .await
        .unwrap();
    let out = drain_stream(response).await;

    let reasoning_at = out.find("\"reasoning_content\":\"because\"").unwrap();
    let content_at = out.find("\"content\":\"done\"").unwrap();
    let finish_at = out.find("\"finish_reason\":\"stop\"").unwrap();
    assert!(reasoning_at < content_at && content_at < finish_at);
    assert!(out.trim_end().ends_with("data: [DONE]"));
    assert!(!out.contains("event:"));

    assert_eq!(
        engine.state().signatures.get(&fingerprint).unwrap(),
        format!("SIG_{}", "A".repeat(56))
    );

    // The pipeline task writes the usage row after the stream drains.
    let mut rows = Vec::new();
    for _ in 0..50 {
        rows = storage.recent_usage(5).await.unwrap();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
    assert_eq!(rows[0].completion_tokens, 2);
}

#[tokio::test]
async fn unknown_model_reports_available_ones() {
    let upstream = MockUpstream::new(Vec::new());
    let (engine, _storage) = engine_with(
        vec![route("claude-3-5-haiku", "anthropic")],
        upstream,
        test_config(),
    )
    .await;

    let body = json!({
        "model": "gpt-nonexistent",
        "messages": [{"role": "user", "content": "hi"}]
    });
    let err = engine
        .handle_chat(chat_call(Proto::OpenAI, body))
        .await
        .unwrap_err();
    match err {
        ProxyError::ModelNotFound { model, available } => {
            assert_eq!(model, "gpt-nonexistent");
            assert_eq!(available, vec!["claude-3-5-haiku"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// Gemini path-style call transcoded to an OpenAI upstream.
#[tokio::test]
async fn gemini_client_openai_upstream() {
    let upstream = MockUpstream::new(vec![MockReply::Json {
        status: 200,
        body: json!({
            "id": "chatcmpl-g",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "bonjour"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })
        .to_string(),
    }]);
    let (engine, _storage) = engine_with(
        vec![route("gpt-4o-mini", "openai")],
        upstream.clone(),
        test_config(),
    )
    .await;

    let body = json!({
        "contents": [{"role": "user", "parts": [{"text": "hello in french"}]}]
    });
    let call = ChatCall {
        endpoint: Proto::Gemini,
        body: Bytes::from(body.to_string()),
        client_authorization: None,
        path_model: Some("gpt-4o-mini".into()),
        force_stream: false,
        trace_id: "trace-gemini".into(),
    };
    let response = engine.handle_chat(call).await.unwrap();
    let value = json_response(response).await;

    let candidate = &value["candidates"][0];
    assert_eq!(candidate["content"]["role"], "model");
    assert_eq!(candidate["content"]["parts"][0]["text"], "bonjour");
    assert_eq!(candidate["finishReason"], "STOP");
    assert_eq!(value["usageMetadata"]["totalTokenCount"], 5);
}
