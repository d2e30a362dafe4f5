//! Per-conversation storage for thought signatures.
//!
//! Reasoning upstreams hand back an opaque signature proving a thinking trace
//! is authentic; the next turn must carry it forward or the upstream rejects
//! the history. Signatures are keyed by a fingerprint of the conversation
//! prefix so concurrent conversations never see each other's signatures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::debug;

/// Compatibility slot for callers that carry no fingerprint.
pub const DEFAULT_SESSION: &str = "default";

/// Signatures shorter than this are treated as invalid unless they ride on an
/// empty thinking block (the trailing-signature shape).
pub const MIN_SIGNATURE_LEN: usize = 50;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SignatureEntry {
    pub signature: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug)]
pub struct SignatureStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, SignatureEntry>>,
}

impl Default for SignatureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SignatureEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert or refresh the signature for a session. An existing entry is
    /// only replaced by a strictly longer signature, so concurrent updates
    /// converge on the longest one observed.
    pub fn store(&self, session: &str, signature: &str) {
        if session.is_empty() || signature.is_empty() {
            return;
        }
        let now = OffsetDateTime::now_utc();
        let mut entries = self.lock();
        let replace = entries
            .get(session)
            .map(|entry| signature.len() > entry.signature.len())
            .unwrap_or(true);
        if replace {
            debug!(
                event = "signature_stored",
                session = %short(session),
                len = signature.len()
            );
            entries.insert(
                session.to_string(),
                SignatureEntry {
                    signature: signature.to_string(),
                    created_at: now,
                    expires_at: now + self.ttl,
                },
            );
        }
    }

    /// Fetch the live signature for a session. A lazily-expired entry is
    /// evicted and treated as absent.
    pub fn get(&self, session: &str) -> Option<String> {
        if session.is_empty() {
            return None;
        }
        let now = OffsetDateTime::now_utc();
        let mut entries = self.lock();
        match entries.get(session) {
            Some(entry) if entry.expires_at > now => Some(entry.signature.clone()),
            Some(_) => {
                entries.remove(session);
                None
            }
            None => None,
        }
    }

    pub fn purge(&self, session: &str) {
        self.lock().remove(session);
    }

    /// Drop every expired entry in a single pass under the lock.
    pub fn sweep(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Background sweeper; runs until the store is dropped everywhere else.
pub fn start_sweeper(
    store: Arc<SignatureStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let dropped = store.sweep();
            if dropped > 0 {
                debug!(event = "signature_sweep", dropped);
            }
        }
    })
}

/// Derive a stable fingerprint from the conversation prefix: role + leading
/// text of the first three messages, each clipped to 200 characters. Works
/// on both `messages` (OpenAI/Anthropic) and `contents` (Gemini) bodies.
pub fn conversation_fingerprint(body: &Value) -> Option<String> {
    let messages = body
        .get("messages")
        .or_else(|| body.get("contents"))?
        .as_array()?;
    if messages.is_empty() {
        return None;
    }

    let mut parts = Vec::new();
    for message in messages.iter().take(3) {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        let text = message
            .get("content")
            .map(fingerprint_text)
            .or_else(|| message.get("parts").map(fingerprint_text))
            .unwrap_or_default();
        parts.push(format!("{role}:{text}"));
    }

    let digest = Sha256::digest(parts.join("|").as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    Some(hex)
}

fn fingerprint_text(content: &Value) -> String {
    match content {
        Value::String(text) => clip(text).to_string(),
        Value::Array(items) => {
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    return clip(text).to_string();
                }
            }
            clip(&content.to_string()).to_string()
        }
        other => clip(&other.to_string()).to_string(),
    }
}

fn clip(text: &str) -> &str {
    const LIMIT: usize = 200;
    if text.len() <= LIMIT {
        return text;
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn short(session: &str) -> &str {
    &session[..session.len().min(8)]
}
