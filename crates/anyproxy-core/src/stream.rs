//! The SSE pipeline: upstream bytes in, client-dialect SSE frames out.
//!
//! One spawned task per streaming request. Upstream reads are paced by the
//! client consumer through the bounded channel; every client frame is one
//! SSE event, flushed by the HTTP layer as it is produced.

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use anyproxy_protocol::error::{
    AnthropicErrorEnvelope, GeminiErrorEnvelope, OpenAIErrorEnvelope,
};
use anyproxy_protocol::sse::{SseEvent, SseParser};
use anyproxy_storage::{RouteStorage, UsageRecord};
use anyproxy_transform::{ChunkEvent, Proto, StreamTransformer, UsageTotals};

use crate::error::upstream_error_message;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
const CANCEL_MARKER: &str = "cancelled by client";

/// Usage-log parameters the pipeline task reports with when the stream ends.
pub struct StreamAccounting {
    pub storage: RouteStorage,
    pub model: String,
    pub route_id: i64,
}

enum StreamEnd {
    UpstreamDone,
    ClientGone,
    UpstreamError(String),
}

pub fn spawn_stream_pipeline(
    upstream_proto: Proto,
    client_proto: Proto,
    mut transformer: StreamTransformer,
    mut upstream_rx: mpsc::Receiver<Bytes>,
    accounting: Option<StreamAccounting>,
    trace_id: String,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut end: Option<StreamEnd> = None;

        'read: while let Some(chunk) = upstream_rx.recv().await {
            for event in parser.push_bytes(&chunk) {
                if let Some(reason) =
                    process_event(upstream_proto, client_proto, &mut transformer, event, &tx)
                        .await
                {
                    end = Some(reason);
                    break 'read;
                }
            }
        }

        if end.is_none() {
            for event in parser.finish() {
                if let Some(reason) =
                    process_event(upstream_proto, client_proto, &mut transformer, event, &tx)
                        .await
                {
                    end = Some(reason);
                    break;
                }
            }
        }

        let end = end.unwrap_or(StreamEnd::UpstreamDone);
        let closing = transformer.finish();
        let client_alive = matches!(end, StreamEnd::UpstreamDone);
        if client_alive {
            // Balance whatever framing is still open, then terminate the
            // OpenAI dialect with its sentinel.
            for event in &closing {
                if let Some(frame) = encode_event(client_proto, event) {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            if client_proto == Proto::OpenAI {
                let _ = tx.send(Bytes::from_static(DONE_FRAME)).await;
            }
        }

        let usage = transformer.usage();
        let (success, error_message) = match &end {
            StreamEnd::UpstreamDone => (true, None),
            StreamEnd::ClientGone => (false, Some(CANCEL_MARKER.to_string())),
            StreamEnd::UpstreamError(message) => (false, Some(message.clone())),
        };
        info!(
            event = "stream_finished",
            trace_id = %trace_id,
            success,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens
        );
        if let Some(accounting) = accounting {
            record_stream_usage(accounting, usage, success, error_message).await;
        }
    });

    rx
}

async fn process_event(
    upstream_proto: Proto,
    client_proto: Proto,
    transformer: &mut StreamTransformer,
    event: SseEvent,
    tx: &mpsc::Sender<Bytes>,
) -> Option<StreamEnd> {
    if event.data.is_empty() {
        return None;
    }
    if event.data == "[DONE]" {
        return Some(StreamEnd::UpstreamDone);
    }

    let value: Value = match serde_json::from_str(&event.data) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "stream_chunk_unparseable", error = %err);
            return None;
        }
    };

    // Mid-stream upstream errors cannot change the HTTP status any more;
    // translate them into an in-band error event and close.
    if is_error_payload(&value) {
        let message = upstream_error_message(&value)
            .unwrap_or_else(|| "upstream stream error".to_string());
        let _ = tx.send(encode_error_event(client_proto, &message)).await;
        return Some(StreamEnd::UpstreamError(message));
    }

    let chunk = match decode_chunk(upstream_proto, value) {
        Ok(chunk) => chunk,
        Err(err) => {
            warn!(event = "stream_chunk_undecodable", error = %err);
            return None;
        }
    };

    let outputs = match transformer.push(chunk) {
        Ok(outputs) => outputs,
        Err(err) => {
            warn!(event = "stream_transform_failed", error = %err);
            return None;
        }
    };

    for output in &outputs {
        let Some(frame) = encode_event(client_proto, output) else {
            continue;
        };
        if tx.send(frame).await.is_err() {
            debug!(event = "stream_client_disconnected");
            return Some(StreamEnd::ClientGone);
        }
    }
    None
}

fn is_error_payload(value: &Value) -> bool {
    if value.get("error").is_some() {
        return true;
    }
    value.get("type").and_then(Value::as_str) == Some("error")
}

fn decode_chunk(proto: Proto, value: Value) -> Result<ChunkEvent, serde_json::Error> {
    Ok(match proto {
        Proto::OpenAI => ChunkEvent::OpenAI(serde_json::from_value(value)?),
        Proto::Claude => ChunkEvent::Claude(serde_json::from_value(value)?),
        Proto::Gemini => ChunkEvent::Gemini(serde_json::from_value(value)?),
    })
}

fn encode_event(client: Proto, event: &ChunkEvent) -> Option<Bytes> {
    match (client, event) {
        (Proto::Claude, ChunkEvent::Claude(event)) => {
            let json = serde_json::to_string(event).ok()?;
            Some(Bytes::from(format!(
                "event: {}\ndata: {}\n\n",
                event.event_name(),
                json
            )))
        }
        (Proto::OpenAI, ChunkEvent::OpenAI(chunk)) => {
            let json = serde_json::to_string(chunk).ok()?;
            Some(Bytes::from(format!("data: {json}\n\n")))
        }
        (Proto::Gemini, ChunkEvent::Gemini(chunk)) => {
            let json = serde_json::to_string(chunk).ok()?;
            Some(Bytes::from(format!("data: {json}\n\n")))
        }
        _ => None,
    }
}

fn encode_error_event(client: Proto, message: &str) -> Bytes {
    match client {
        Proto::Claude => {
            let envelope = AnthropicErrorEnvelope::new("api_error", message);
            let json = serde_json::to_string(&envelope).unwrap_or_default();
            Bytes::from(format!("event: error\ndata: {json}\n\n"))
        }
        Proto::OpenAI => {
            let envelope = OpenAIErrorEnvelope::new("api_error", message);
            let json = serde_json::to_string(&envelope).unwrap_or_default();
            Bytes::from(format!("data: {json}\n\n"))
        }
        Proto::Gemini => {
            let envelope = GeminiErrorEnvelope::new(502, "INTERNAL", message);
            let json = serde_json::to_string(&envelope).unwrap_or_default();
            Bytes::from(format!("data: {json}\n\n"))
        }
    }
}

async fn record_stream_usage(
    accounting: StreamAccounting,
    usage: UsageTotals,
    success: bool,
    error_message: Option<String>,
) {
    let record = UsageRecord {
        model: accounting.model,
        route_id: accounting.route_id,
        prompt_tokens: usage.input_tokens as i64,
        completion_tokens: usage.output_tokens as i64,
        total_tokens: usage.total() as i64,
        success,
        error_message,
    };
    if let Err(err) = accounting.storage.record_usage(record).await {
        warn!(event = "usage_log_failed", error = %err);
    }
}
