//! HTTP adapter for OpenAI-style chat completions and Gemini generateContent.
//!
//! The provider dialect is detected from the configured base URL/endpoint;
//! auth header style follows the dialect unless overridden. Every request
//! and response passes through the [`TrafficLog`](super::TrafficLog) with
//! credentials redacted.

use super::{AdapterError, AdapterErrorKind, ChatReply, LlmAdapter, TrafficLog};
use crate::message::ChatMessage;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How credentials are attached to outbound requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-goog-api-key: <key>`
    GoogleHeader,
    /// `?key=<key>` appended to the request URL
    QueryParam,
}

/// Adapter configuration, normally loaded from the engine config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub base_url: String,
    /// Explicit endpoint path; derived from the dialect when absent.
    #[serde(default)]
    pub endpoint_path: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Auth header style; defaults per dialect when absent.
    #[serde(default)]
    pub auth_style: Option<AuthStyle>,
    /// Model alias map: engine-facing alias to provider model id.
    #[serde(default)]
    pub models: FxHashMap<String, String>,
    #[serde(default = "AdapterConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl AdapterConfig {
    fn default_timeout_secs() -> u64 {
        30
    }

    /// True when the config points at Gemini generateContent.
    #[must_use]
    pub fn is_gemini(&self) -> bool {
        let endpoint = self.endpoint_path.as_deref().unwrap_or_default();
        self.base_url
            .to_ascii_lowercase()
            .contains("generativelanguage.googleapis.com")
            || endpoint.to_ascii_lowercase().contains(":generatecontent")
    }

    fn resolve_model(&self, alias: &str) -> String {
        self.models
            .get(alias)
            .cloned()
            .unwrap_or_else(|| alias.to_string())
    }

    fn resolved_auth_style(&self) -> AuthStyle {
        self.auth_style.unwrap_or(if self.is_gemini() {
            AuthStyle::GoogleHeader
        } else {
            AuthStyle::Bearer
        })
    }

    fn request_url(&self, model: &str) -> String {
        let endpoint = match self.endpoint_path.as_deref() {
            Some(e) if !e.trim().is_empty() => e.trim().to_string(),
            _ if self.is_gemini() => format!("/v1beta/models/{model}:generateContent"),
            _ => "/v1/chat/completions".to_string(),
        };
        if endpoint.contains("://") {
            return endpoint;
        }
        let base = self.base_url.trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        if base.ends_with(path) {
            base.to_string()
        } else {
            format!("{base}/{path}")
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            endpoint_path: None,
            api_key: None,
            auth_style: None,
            models: FxHashMap::default(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

/// Production [`LlmAdapter`] backed by `reqwest`.
pub struct HttpLlmAdapter {
    client: reqwest::Client,
    config: AdapterConfig,
    traffic: Arc<TrafficLog>,
}

impl HttpLlmAdapter {
    #[must_use]
    pub fn new(config: AdapterConfig, traffic: Arc<TrafficLog>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            traffic,
        }
    }

    fn build_payload(&self, model: &str, messages: &[ChatMessage]) -> Value {
        if self.config.is_gemini() {
            gemini_payload(messages)
        } else {
            json!({ "model": model, "messages": messages })
        }
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        if self.config.is_gemini() {
            extract_gemini_text(body)
        } else {
            body.get("choices")?
                .get(0)?
                .get("message")?
                .get("content")?
                .as_str()
                .map(str::to_string)
        }
    }

    fn classify(err: &reqwest::Error) -> AdapterErrorKind {
        if err.is_timeout() {
            AdapterErrorKind::Timeout
        } else if err.is_connect() {
            AdapterErrorKind::Unavailable
        } else {
            AdapterErrorKind::Protocol
        }
    }
}

#[async_trait]
impl LlmAdapter for HttpLlmAdapter {
    async fn chat(
        &self,
        model_alias: &str,
        messages: &[ChatMessage],
        timeout: Option<Duration>,
    ) -> Result<ChatReply, AdapterError> {
        let model = self.config.resolve_model(model_alias);
        let mut url = self.config.request_url(&model);
        let payload = self.build_payload(&model, messages);
        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.timeout_secs));

        let mut headers = json!({ "Content-Type": "application/json" });
        match (&self.config.api_key, self.config.resolved_auth_style()) {
            (Some(key), AuthStyle::Bearer) => {
                headers["Authorization"] = json!(format!("Bearer {key}"));
            }
            (Some(key), AuthStyle::GoogleHeader) => {
                headers["x-goog-api-key"] = json!(key.clone());
            }
            (Some(key), AuthStyle::QueryParam) => {
                let sep = if url.contains('?') { '&' } else { '?' };
                url = format!("{url}{sep}key={key}");
            }
            (None, _) => {
                tracing::warn!(alias = model_alias, "llm adapter has no api key configured");
            }
        }

        let pair_id = self.traffic.log_request("POST", &url, &headers, &payload);
        let started = Instant::now();

        let mut request = self.client.post(&url).json(&payload).timeout(timeout);
        if let Some(obj) = headers.as_object() {
            for (name, value) in obj {
                if let Some(v) = value.as_str() {
                    request = request.header(name.as_str(), v);
                }
            }
        }

        let response = request.send().await.map_err(|e| {
            let kind = Self::classify(&e);
            self.traffic.log_error(Some(&pair_id), &e.to_string(), None);
            AdapterError::new(kind, e.to_string())
        })?;

        let status = response.status();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let body: Value = response.json().await.map_err(|e| {
            self.traffic
                .log_error(Some(&pair_id), &e.to_string(), Some(status.as_u16()));
            AdapterError::new(AdapterErrorKind::Protocol, e.to_string())
        })?;
        self.traffic
            .log_response(&pair_id, status.as_u16(), &body, elapsed_ms);

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AdapterError::new(
                AdapterErrorKind::Auth,
                format!("provider rejected credentials ({status})"),
            ));
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AdapterError::new(
                AdapterErrorKind::Unavailable,
                format!("provider unavailable ({status})"),
            ));
        }
        if !status.is_success() {
            return Err(AdapterError::new(
                AdapterErrorKind::Protocol,
                format!("unexpected status {status}"),
            ));
        }

        let text = self.extract_text(&body).ok_or_else(|| {
            AdapterError::new(
                AdapterErrorKind::Protocol,
                "response missing message content",
            )
        })?;
        let usage = body.get("usage").or_else(|| body.get("usageMetadata")).cloned();
        Ok(ChatReply {
            text,
            usage,
            raw: Some(body),
        })
    }
}

/// Maps OpenAI-style messages onto a Gemini generateContent payload.
///
/// System messages concatenate into `systemInstruction`; assistant turns
/// carry `role: "model"`; user turns omit the role, matching the official
/// request samples.
fn gemini_payload(messages: &[ChatMessage]) -> Value {
    let mut system_texts: Vec<&str> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for msg in messages {
        if msg.has_role(ChatMessage::SYSTEM) {
            if !msg.content.is_empty() {
                system_texts.push(&msg.content);
            }
            continue;
        }
        let mut content = json!({ "parts": [{ "text": msg.content }] });
        if msg.has_role(ChatMessage::ASSISTANT) {
            content["role"] = json!("model");
        }
        contents.push(content);
    }
    let mut payload = json!({ "contents": contents });
    if !system_texts.is_empty() {
        payload["systemInstruction"] = json!({ "parts": [{ "text": system_texts.join("\n\n") }] });
    }
    payload
}

fn extract_gemini_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .filter(|t| !t.is_empty())
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}
