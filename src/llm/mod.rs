//! The language-model adapter boundary.
//!
//! The engine only ever talks to a model through [`LlmAdapter`]; provider
//! payload translation, auth header selection, and endpoint resolution all
//! live behind it. [`http::HttpLlmAdapter`] is the production implementation;
//! [`MockLlmAdapter`] serves tests and the `unavailable` fallback path.

pub mod http;
pub mod traffic;

use crate::message::ChatMessage;
use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub use http::{AdapterConfig, AuthStyle, HttpLlmAdapter};
pub use traffic::{TrafficEvent, TrafficLog};

/// Why an adapter call failed, as seen by the rest of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    /// The request exceeded its deadline.
    Timeout,
    /// The provider could not be reached at all.
    Unavailable,
    /// The provider answered, but not with anything usable.
    Protocol,
    /// The provider rejected our credentials.
    Auth,
}

/// Adapter failure with its classified kind.
#[derive(Debug, Error, Diagnostic)]
#[error("llm adapter error ({kind:?}): {message}")]
#[diagnostic(
    code(taleloom::llm::adapter),
    help("Check the adapter base_url, credentials, and model alias map.")
)]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    #[must_use]
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A successful model reply.
#[derive(Clone, Debug, Default)]
pub struct ChatReply {
    /// The reply text.
    pub text: String,
    /// Provider-reported token usage, when available.
    pub usage: Option<Value>,
    /// The raw provider response body, for debugging.
    pub raw: Option<Value>,
}

/// Contract consumed by `LLMChat` nodes and the job worker.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Sends a chat request to the model behind `model_alias`.
    ///
    /// `timeout` overrides the adapter's configured deadline when given.
    async fn chat(
        &self,
        model_alias: &str,
        messages: &[ChatMessage],
        timeout: Option<Duration>,
    ) -> Result<ChatReply, AdapterError>;
}

/// Deterministic canned reply for a model alias.
///
/// Used by [`MockLlmAdapter`] and by `LLMChat` when the real adapter reports
/// `unavailable` and the node is configured to degrade to a mock.
#[must_use]
pub fn mock_reply(model_alias: &str, messages: &[ChatMessage]) -> String {
    match model_alias {
        "narrative-llm" => {
            "Neon bleeds across the wet cobbles as you push deeper into the data bazaar, \
             collar up against the static drizzle."
                .to_string()
        }
        "analyzer-llm" => {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.has_role(ChatMessage::USER))
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            if last_user.contains("attack") || last_user.contains("flee") {
                "[updated mood] adrenaline spiking, tense and combative".to_string()
            } else {
                "[updated mood] watchful, but easing slightly".to_string()
            }
        }
        "guidance-llm" => {
            "[guidance] introduce the informant early and let the player choose the meeting spot"
                .to_string()
        }
        "summarizer-llm" => {
            "[summary] the runner slipped the patrols and now works the data bazaar for a lead"
                .to_string()
        }
        other => format!("[mock reply from {other}]"),
    }
}

/// In-process adapter returning [`mock_reply`] for every call.
#[derive(Debug, Default)]
pub struct MockLlmAdapter;

#[async_trait]
impl LlmAdapter for MockLlmAdapter {
    async fn chat(
        &self,
        model_alias: &str,
        messages: &[ChatMessage],
        _timeout: Option<Duration>,
    ) -> Result<ChatReply, AdapterError> {
        Ok(ChatReply {
            text: mock_reply(model_alias, messages),
            usage: None,
            raw: None,
        })
    }
}

/// Adapter that always fails with a fixed kind. Test-oriented.
#[derive(Debug)]
pub struct FailingLlmAdapter {
    pub kind: AdapterErrorKind,
}

#[async_trait]
impl LlmAdapter for FailingLlmAdapter {
    async fn chat(
        &self,
        _model_alias: &str,
        _messages: &[ChatMessage],
        _timeout: Option<Duration>,
    ) -> Result<ChatReply, AdapterError> {
        Err(AdapterError::new(self.kind, "synthetic adapter failure"))
    }
}
