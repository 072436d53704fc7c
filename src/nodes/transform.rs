//! Stream-shaping nodes: Map, Filter, Merge, Split.
//!
//! All four evaluate JMESPath expressions against the bare item. Per-item
//! expression failures degrade to a log line and pass the item through
//! (Filter keeps it), so one malformed record never sinks the whole stream.

use super::{param_bool, param_str};
use crate::expr;
use crate::item::Item;
use crate::node::{FlowNode, NodeContext, NodeError, NodeResult};
use crate::registry::NodeRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub fn register(registry: &mut NodeRegistry) {
    let _ = registry.register("Map", Arc::new(|p| Box::new(MapNode::new(p))), true);
    let _ = registry.register("Filter", Arc::new(|p| Box::new(FilterNode::new(p))), true);
    let _ = registry.register("Merge", Arc::new(|p| Box::new(MergeNode::new(p))), true);
    let _ = registry.register("Split", Arc::new(|p| Box::new(SplitNode::new(p))), true);
}

/// Sets fields computed from expressions over the item.
///
/// Params:
/// - `set`: map of destination field to JMESPath expression
/// - `overwrite`: replace existing fields, default true
pub struct MapNode {
    params: Value,
}

impl MapNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FlowNode for MapNode {
    fn type_name(&self) -> &'static str {
        "Map"
    }

    async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let rules = super::param_object(&self.params, "set");
        let overwrite = param_bool(&self.params, "overwrite", true);

        let mut result = NodeResult::default();
        for item in items {
            let mut out = item.clone();
            let mut failed = false;
            for (dest, rule) in &rules {
                let Some(expr) = rule.as_str() else {
                    result.log(format!("Map skipped non-string rule for '{dest}'"));
                    continue;
                };
                match expr::search_item(expr, item) {
                    Ok(value) => {
                        if overwrite || !out.contains_key(dest) {
                            out.insert(dest.clone(), value);
                        }
                    }
                    Err(err) => {
                        result.log(format!("Map error: {err}"));
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                result.log(format!("Map applied {} rule(s)", rules.len()));
            }
            result.items.push(out);
        }
        Ok(result)
    }
}

/// Keeps items where the `where` predicate evaluates truthy.
pub struct FilterNode {
    params: Value,
}

impl FilterNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FlowNode for FilterNode {
    fn type_name(&self) -> &'static str {
        "Filter"
    }

    async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let Some(predicate) = self.params.get("where").and_then(Value::as_str) else {
            return Err(NodeError::MissingInput { what: "where" });
        };

        let mut result = NodeResult::default();
        for item in items {
            match expr::search_item(predicate, item) {
                Ok(value) => {
                    let keep = expr::truthy(&value);
                    result.log(format!(
                        "Filter[{predicate}]: {}",
                        if keep { "keep" } else { "drop" }
                    ));
                    if keep {
                        result.items.push(item.clone());
                    }
                }
                Err(err) => {
                    // evaluation failure keeps the item rather than losing data
                    result.log(format!("Filter error: {err}"));
                    result.items.push(item.clone());
                }
            }
        }
        Ok(result)
    }
}

/// Identity on the current stream, optionally appending a constant sequence.
///
/// Params:
/// - `with`: sequence of constant items appended after the inbound stream
pub struct MergeNode {
    params: Value,
}

impl MergeNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FlowNode for MergeNode {
    fn type_name(&self) -> &'static str {
        "Merge"
    }

    async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let mut result = NodeResult::with_items(items.to_vec());
        if let Some(extra) = self.params.get("with").and_then(Value::as_array) {
            let mut appended = 0usize;
            for value in extra {
                match serde_json::from_value::<Item>(value.clone()) {
                    Ok(item) => {
                        result.items.push(item);
                        appended += 1;
                    }
                    Err(_) => result.log("Merge skipped non-record entry in 'with'".to_string()),
                }
            }
            result.log(format!("Merge appended {appended} item(s)"));
        }
        Ok(result)
    }
}

/// Produces one output item per element of a sequence-valued path.
///
/// Params:
/// - `at`: JMESPath path yielding a sequence (required)
/// - `into`: field the element lands in on each copy, default `element`
pub struct SplitNode {
    params: Value,
}

impl SplitNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FlowNode for SplitNode {
    fn type_name(&self) -> &'static str {
        "Split"
    }

    async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let Some(at) = self.params.get("at").and_then(Value::as_str) else {
            return Err(NodeError::MissingInput { what: "at" });
        };
        let into = param_str(&self.params, "into", "element");

        let mut result = NodeResult::default();
        for item in items {
            match expr::search_item(at, item) {
                Ok(Value::Array(elements)) => {
                    result.log(format!(
                        "Split {} element(s) from {at} into {into}",
                        elements.len()
                    ));
                    for element in elements {
                        let mut out = item.clone();
                        out.insert(into.clone(), element);
                        result.items.push(out);
                    }
                }
                Ok(other) => {
                    result.log(format!(
                        "Split error: '{at}' yielded {} instead of a sequence",
                        type_label(&other)
                    ));
                    result.items.push(item.clone());
                }
                Err(err) => {
                    result.log(format!("Split error: {err}"));
                    result.items.push(item.clone());
                }
            }
        }
        Ok(result)
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "record",
    }
}
