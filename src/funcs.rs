//! Whitelisted code functions available to `Code` nodes.
//!
//! These build the message lists for the bundled flows: the main narrative
//! turn, the analyzer pass behind the gating StatusUpdate job, and the
//! non-blocking guidance and summarization passes. They are registered
//! under their names in the default resource bag; workflow documents call
//! them via `{"type": "Code", "params": {"function":
//! "build_narrative_messages"}}`.

use crate::item::Item;
use crate::message::ChatMessage;
use crate::node::{CodeFunc, NodeContext, NodeError};
use crate::state::StateMap;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::sync::Arc;

/// Renders a state view as a `[world_state]` system prompt block.
///
/// Keys are sorted for stable prompts; string values print bare.
#[must_use]
pub fn state_system_prompt(view: &StateMap) -> String {
    let mut keys: Vec<&String> = view.keys().collect();
    keys.sort();
    if keys.is_empty() {
        return "[world_state]\n(empty)".to_string();
    }
    let lines: Vec<String> = keys
        .iter()
        .map(|k| format!("{k}={}", render(&view[k.as_str()])))
        .collect();
    format!("[world_state]\n{}", lines.join("\n"))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn item_text(item: &Item, keys: &[&str]) -> String {
    for key in keys {
        if let Some(Value::String(s)) = item.get(*key) {
            if !s.trim().is_empty() {
                return s.trim().to_string();
            }
        }
    }
    String::new()
}

fn messages_value(messages: Vec<ChatMessage>) -> Value {
    serde_json::to_value(messages).unwrap_or_else(|_| json!([]))
}

/// Builds the main narrative prompt: world-state system message plus the
/// player's input as the user turn.
pub fn build_narrative_messages(item: &Item, ctx: &NodeContext) -> Result<Item, NodeError> {
    let view = ctx.state.get_for_prompt();
    let mut messages = vec![ChatMessage::system(&state_system_prompt(&view))];
    let user_text = item_text(item, &["user_input"]);
    if !user_text.is_empty() {
        messages.push(ChatMessage::user(&user_text));
    }
    let mut out = Item::default();
    out.insert("messages".to_string(), messages_value(messages));
    Ok(out)
}

/// Builds the analyzer prompt used by the gating StatusUpdate subflow: the
/// snapshot state plus the narrative text to analyze.
pub fn build_analyzer_messages(item: &Item, ctx: &NodeContext) -> Result<Item, NodeError> {
    let view = ctx.state.get_for_prompt();
    let mut messages = vec![ChatMessage::system(&state_system_prompt(&view))];
    let text = item_text(item, &["text", "llm_response", "narrative"]);
    if !text.is_empty() {
        messages.push(ChatMessage::user(&text));
    }
    let mut out = Item::default();
    out.insert("messages".to_string(), messages_value(messages));
    Ok(out)
}

/// Builds the prompt for the non-blocking guidance pass.
pub fn build_guidance_messages(item: &Item, ctx: &NodeContext) -> Result<Item, NodeError> {
    let view = ctx.state.get_for_prompt();
    let mut lines = vec!["[guidance_context]".to_string()];
    for key in ["location", "protagonist_mood", "turn_count"] {
        if let Some(value) = view.get(key) {
            lines.push(format!("{key}={}", render(value)));
        }
    }
    let mut messages = vec![ChatMessage::system(&lines.join("\n"))];
    let recent = item_text(item, &["narrative", "text"]);
    if recent.is_empty() {
        messages.push(ChatMessage::user(
            "Draft behind-the-scenes guidance for the next story beat.",
        ));
    } else {
        messages.push(ChatMessage::user(&format!(
            "Based on the recent narrative, draft behind-the-scenes guidance:\n{recent}"
        )));
    }
    let mut out = Item::default();
    out.insert("messages".to_string(), messages_value(messages));
    Ok(out)
}

/// Builds the prompt for the non-blocking summarization pass.
///
/// The item carries the turn range covered by the round's anchor snapshot
/// (`range_start`/`range_end`) and the latest narrative text; the summary
/// rolls the prior summary forward when one exists.
pub fn build_summarize_messages(item: &Item, ctx: &NodeContext) -> Result<Item, NodeError> {
    let view = ctx.state.get_for_prompt();
    let mut lines = vec!["[summary_context]".to_string()];
    if let Some(prior) = view.get("story_summary") {
        lines.push(format!("story_summary={}", render(prior)));
    }
    for key in ["location", "turn_count"] {
        if let Some(value) = view.get(key) {
            lines.push(format!("{key}={}", render(value)));
        }
    }
    let mut messages = vec![ChatMessage::system(&lines.join("\n"))];

    let start = item.get("range_start").and_then(Value::as_u64).unwrap_or(0);
    let end = item.get("range_end").and_then(Value::as_u64).unwrap_or(0);
    let recent = item_text(item, &["text", "narrative"]);
    let mut ask = format!("Summarize the story through turns {start}..{end}.");
    if !recent.is_empty() {
        ask.push_str(&format!("\nLatest narrative:\n{recent}"));
    }
    messages.push(ChatMessage::user(&ask));

    let mut out = Item::default();
    out.insert("messages".to_string(), messages_value(messages));
    Ok(out)
}

/// The default whitelist handed to every node context.
#[must_use]
pub fn default_code_funcs() -> FxHashMap<String, CodeFunc> {
    let mut funcs: FxHashMap<String, CodeFunc> = FxHashMap::default();
    funcs.insert(
        "build_narrative_messages".to_string(),
        Arc::new(build_narrative_messages) as CodeFunc,
    );
    funcs.insert(
        "build_analyzer_messages".to_string(),
        Arc::new(build_analyzer_messages) as CodeFunc,
    );
    funcs.insert(
        "build_guidance_messages".to_string(),
        Arc::new(build_guidance_messages) as CodeFunc,
    );
    funcs.insert(
        "build_summarize_messages".to_string(),
        Arc::new(build_summarize_messages) as CodeFunc,
    );
    funcs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::item_with;
    use crate::node::Resources;
    use crate::state::StateManager;

    fn ctx() -> NodeContext {
        let mut state = StateMap::default();
        state.insert("location".into(), json!("tavern"));
        state.insert("turn_count".into(), json!(2));
        NodeContext::detached(
            Arc::new(StateManager::new(state)),
            Arc::new(Resources::default()),
        )
    }

    #[test]
    fn system_prompt_is_sorted_and_bare() {
        let mut view = StateMap::default();
        view.insert("b".into(), json!("two"));
        view.insert("a".into(), json!(1));
        assert_eq!(state_system_prompt(&view), "[world_state]\na=1\nb=two");
        assert_eq!(
            state_system_prompt(&StateMap::default()),
            "[world_state]\n(empty)"
        );
    }

    #[test]
    fn narrative_builder_includes_user_turn() {
        let item = item_with("user_input", json!("enter tavern"));
        let out = build_narrative_messages(&item, &ctx()).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0]["content"]
            .as_str()
            .unwrap()
            .contains("location=tavern"));
        assert_eq!(messages[1]["content"], json!("enter tavern"));
    }

    #[test]
    fn analyzer_builder_prefers_text_field() {
        let mut item = item_with("text", json!("the narrative"));
        item.insert("llm_response".into(), json!("ignored"));
        let out = build_analyzer_messages(&item, &ctx()).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[1]["content"], json!("the narrative"));
    }

    #[test]
    fn guidance_builder_always_has_a_user_turn() {
        let out = build_guidance_messages(&Item::default(), &ctx()).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["role"], json!("user"));
    }

    #[test]
    fn summarize_builder_names_the_turn_range_and_prior_summary() {
        let context = ctx();
        context
            .state
            .update_state_sync([("story_summary".to_string(), json!("so far: a chase"))]);
        let mut item = item_with("text", json!("the chase ends at the docks"));
        item.insert("range_start".into(), json!(0));
        item.insert("range_end".into(), json!(4));
        let out = build_summarize_messages(&item, &context).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert!(messages[0]["content"]
            .as_str()
            .unwrap()
            .contains("story_summary=so far: a chase"));
        let ask = messages[1]["content"].as_str().unwrap();
        assert!(ask.contains("turns 0..4"));
        assert!(ask.contains("the chase ends at the docks"));
    }
}
