//! The `LLMChat` node: one adapter call per item.

use super::{param_bool, param_str};
use crate::funcs;
use crate::item::Item;
use crate::llm::{mock_reply, AdapterErrorKind};
use crate::message::{sanitize_messages, ChatMessage};
use crate::node::{FlowNode, NodeContext, NodeError, NodeResult};
use crate::registry::NodeRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub fn register(registry: &mut NodeRegistry) {
    let _ = registry.register("LLMChat", Arc::new(|p| Box::new(LlmChatNode::new(p))), true);
}

/// Calls the language model with each item's message list and writes the
/// reply back onto the item.
///
/// Params:
/// - `model`: adapter model alias, default `narrative-llm`
/// - `messages_from`: item field holding the message list, default `messages`
/// - `response_field`: field the reply text lands in, default `llm_response`
/// - `mock_on_unavailable`: degrade to a canned reply when the provider is
///   unreachable, default true
///
/// A missing or malformed message list falls back to a minimal system+user
/// pair built from the prompt state view and `item.user_input`. Adapter
/// failures leave the item unchanged and log the error; the stream keeps
/// flowing.
pub struct LlmChatNode {
    params: Value,
}

impl LlmChatNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }

    fn fallback_messages(item: &Item, ctx: &NodeContext) -> Vec<ChatMessage> {
        funcs::build_narrative_messages(item, ctx)
            .ok()
            .and_then(|out| out.get("messages").map(|m| sanitize_messages(m)))
            .unwrap_or_default()
    }
}

#[async_trait]
impl FlowNode for LlmChatNode {
    fn type_name(&self) -> &'static str {
        "LLMChat"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let model = param_str(&self.params, "model", "narrative-llm");
        let messages_from = param_str(&self.params, "messages_from", "messages");
        let response_field = param_str(&self.params, "response_field", "llm_response");
        let mock_on_unavailable = param_bool(&self.params, "mock_on_unavailable", true);

        let Some(adapter) = ctx.resources.llm.clone() else {
            return Err(NodeError::MissingInput { what: "llm adapter" });
        };

        let mut result = NodeResult::default();
        for item in items {
            let messages = match item.get(&messages_from) {
                Some(raw) => {
                    let parsed = sanitize_messages(raw);
                    if parsed.is_empty() {
                        Self::fallback_messages(item, ctx)
                    } else {
                        parsed
                    }
                }
                None => Self::fallback_messages(item, ctx),
            };

            match adapter.chat(&model, &messages, None).await {
                Ok(reply) => {
                    let mut out = item.clone();
                    out.insert(response_field.clone(), Value::String(reply.text));
                    result.items.push(out);
                    result.log(format!("LLMChat: model={model}, field={response_field}"));
                }
                Err(err) if err.kind == AdapterErrorKind::Unavailable && mock_on_unavailable => {
                    let mut out = item.clone();
                    out.insert(
                        response_field.clone(),
                        Value::String(mock_reply(&model, &messages)),
                    );
                    result.items.push(out);
                    result.log(format!("LLMChat: provider unavailable, mocked reply ({err})"));
                }
                Err(err) => {
                    result.items.push(item.clone());
                    result.log(format!("LLMChat error: {err}"));
                }
            }
        }
        Ok(result)
    }
}
