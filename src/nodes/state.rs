//! State-touching nodes: ReadState, WriteState, IncrementCounter.

use super::{param_bool, param_i64, param_object};
use crate::item::Item;
use crate::node::{FlowNode, NodeContext, NodeError, NodeResult};
use crate::registry::NodeRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub fn register(registry: &mut NodeRegistry) {
    let _ = registry.register("ReadState", Arc::new(|p| Box::new(ReadStateNode::new(p))), true);
    let _ = registry.register("WriteState", Arc::new(|p| Box::new(WriteStateNode::new(p))), true);
    let _ = registry.register(
        "IncrementCounter",
        Arc::new(|p| Box::new(IncrementCounterNode::new(p))),
        true,
    );
}

/// Copies state values (prompt view) into each item.
///
/// Params:
/// - `keys`: list of state keys copied under their own names
/// - `map`: source state key to destination item field
///
/// Either form may be used; `map` wins on overlapping destinations. The
/// prompt view means pending keys read their last stable value.
pub struct ReadStateNode {
    params: Value,
}

impl ReadStateNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FlowNode for ReadStateNode {
    fn type_name(&self) -> &'static str {
        "ReadState"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let view = ctx.state.get_for_prompt();
        let mut pairs: Vec<(String, String)> = Vec::new();
        if let Some(keys) = self.params.get("keys").and_then(Value::as_array) {
            for key in keys.iter().filter_map(Value::as_str) {
                pairs.push((key.to_string(), key.to_string()));
            }
        }
        for (src, dest) in param_object(&self.params, "map") {
            if let Some(dest) = dest.as_str() {
                pairs.push((src, dest.to_string()));
            }
        }
        if pairs.is_empty() {
            return Err(NodeError::MissingInput { what: "keys or map" });
        }

        let mut result = NodeResult::default();
        for item in items {
            let mut out = item.clone();
            for (src, dest) in &pairs {
                if let Some(value) = view.get(src) {
                    out.insert(dest.clone(), value.clone());
                }
            }
            result.items.push(out);
        }
        result.log(format!(
            "ReadState copied {} key(s) into {} item(s)",
            pairs.len(),
            items.len()
        ));
        Ok(result)
    }
}

/// Writes item fields into state via `update_state_sync`.
///
/// Params:
/// - `from_item_map`: item field to state key
/// - `updates`: constant key/value pairs written as-is
/// - `per_item`: collect from every item instead of only the first
///
/// Items pass through unchanged; this node is pure side effect.
pub struct WriteStateNode {
    params: Value,
}

impl WriteStateNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }

    fn collect(mapping: &[(String, Value)], item: &Item) -> Vec<(String, Value)> {
        let mut updates = Vec::new();
        for (src, dest) in mapping {
            let Some(dest) = dest.as_str() else { continue };
            if let Some(value) = item.get(src) {
                updates.push((dest.to_string(), value.clone()));
            }
        }
        updates
    }
}

#[async_trait]
impl FlowNode for WriteStateNode {
    fn type_name(&self) -> &'static str {
        "WriteState"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let mapping = param_object(&self.params, "from_item_map");
        let per_item = param_bool(&self.params, "per_item", false);

        let mut updates: Vec<(String, Value)> = param_object(&self.params, "updates");
        if per_item {
            for item in items {
                updates.extend(Self::collect(&mapping, item));
            }
        } else if let Some(first) = items.first() {
            updates.extend(Self::collect(&mapping, first));
        }

        let mut result = NodeResult::with_items(items.to_vec());
        if updates.is_empty() {
            result.log("WriteState no-op: no updates".to_string());
        } else {
            let keys: Vec<&str> = updates.iter().map(|(k, _)| k.as_str()).collect();
            result.log(format!("WriteState committed: {keys:?}"));
            ctx.state.update_state_sync(updates);
        }
        Ok(result)
    }
}

/// Adds `step` (default 1) to a numeric state field, creating it at 0.
pub struct IncrementCounterNode {
    params: Value,
}

impl IncrementCounterNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FlowNode for IncrementCounterNode {
    fn type_name(&self) -> &'static str {
        "IncrementCounter"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let Some(field) = self.params.get("field").and_then(Value::as_str) else {
            return Err(NodeError::MissingInput { what: "field" });
        };
        let step = param_i64(&self.params, "step", 1);
        let current = ctx
            .state
            .read(field)
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let next = current + step;
        ctx.state
            .update_state_sync([(field.to_string(), Value::from(next))]);

        let mut result = NodeResult::with_items(items.to_vec());
        result.log(format!("IncrementCounter: {field} -> {next}"));
        Ok(result)
    }
}
