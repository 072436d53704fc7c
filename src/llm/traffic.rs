//! Bounded in-memory log of outbound LLM traffic, for the debug console.
//!
//! Every adapter request/response/error lands here as a redacted, excerpted
//! event. The buffer is a ring: oldest events fall off once capacity is hit.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

const BODY_EXCERPT_LIMIT: usize = 2048;
const ERROR_EXCERPT_LIMIT: usize = 1024;

/// One captured traffic event.
#[derive(Clone, Debug, Serialize)]
pub struct TrafficEvent {
    pub id: String,
    pub ts: String,
    /// "request" | "response" | "error"
    pub r#type: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_headers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Links responses and errors back to their request event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair_id: Option<String>,
}

impl TrafficEvent {
    fn blank(kind: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            r#type: kind.to_string(),
            service: "llm".to_string(),
            method: None,
            url: None,
            req_headers: None,
            req_body: None,
            status: None,
            elapsed_ms: None,
            resp_body: None,
            error: None,
            pair_id: None,
        }
    }
}

/// Thread-safe ring buffer of [`TrafficEvent`]s.
pub struct TrafficLog {
    buf: Mutex<VecDeque<TrafficEvent>>,
    capacity: usize,
}

impl TrafficLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::new()),
            capacity: capacity.max(50),
        }
    }

    pub fn clear(&self) {
        self.buf.lock().clear();
    }

    fn push(&self, event: TrafficEvent) {
        let mut buf = self.buf.lock();
        buf.push_back(event);
        while buf.len() > self.capacity {
            buf.pop_front();
        }
    }

    /// Records an outbound request; returns the event id for pairing.
    pub fn log_request(&self, method: &str, url: &str, headers: &Value, body: &Value) -> String {
        let mut event = TrafficEvent::blank("request");
        event.method = Some(method.to_uppercase());
        event.url = Some(redact_url(url));
        event.req_headers = Some(redact_headers(headers));
        event.req_body = Some(excerpt(body, BODY_EXCERPT_LIMIT));
        let id = event.id.clone();
        self.push(event);
        id
    }

    pub fn log_response(&self, pair_id: &str, status: u16, body: &Value, elapsed_ms: u64) {
        let mut event = TrafficEvent::blank("response");
        event.status = Some(status);
        event.elapsed_ms = Some(elapsed_ms);
        event.resp_body = Some(excerpt(body, BODY_EXCERPT_LIMIT));
        event.pair_id = Some(pair_id.to_string());
        self.push(event);
    }

    pub fn log_error(&self, pair_id: Option<&str>, error: &str, status: Option<u16>) {
        let mut event = TrafficEvent::blank("error");
        event.status = status;
        event.error = Some(truncate(error, ERROR_EXCERPT_LIMIT));
        event.pair_id = pair_id.map(str::to_string);
        self.push(event);
    }

    /// The most recent `limit` events, oldest first. `0` returns everything.
    #[must_use]
    pub fn events(&self, limit: usize) -> Vec<TrafficEvent> {
        let buf = self.buf.lock();
        let skip = if limit == 0 || limit >= buf.len() {
            0
        } else {
            buf.len() - limit
        };
        buf.iter().skip(skip).cloned().collect()
    }
}

impl Default for TrafficLog {
    fn default() -> Self {
        Self::new(300)
    }
}

const REDACTED_QUERY_KEYS: [&str; 5] = ["key", "api_key", "apikey", "token", "access_token"];

fn redact_url(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, _)) if REDACTED_QUERY_KEYS.contains(&k.to_ascii_lowercase().as_str()) => {
                format!("{k}=***")
            }
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", redacted.join("&"))
}

fn redact_headers(headers: &Value) -> Value {
    let Some(map) = headers.as_object() else {
        return headers.clone();
    };
    let redacted = map
        .iter()
        .map(|(k, v)| {
            let kl = k.to_ascii_lowercase();
            let sensitive = kl.contains("authorization")
                || kl.contains("api-key")
                || kl.contains("x-goog-api-key")
                || kl.contains("bearer");
            let value = if sensitive {
                Value::String("***".to_string())
            } else {
                v.clone()
            };
            (k.clone(), value)
        })
        .collect();
    Value::Object(redacted)
}

fn excerpt(value: &Value, limit: usize) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate(&rendered, limit)
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}
