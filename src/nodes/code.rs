//! The `Code` node: invokes a whitelisted function against each item.

use crate::funcs;
use crate::item::Item;
use crate::node::{CodeFunc, FlowNode, NodeContext, NodeError, NodeResult};
use crate::registry::NodeRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub fn register(registry: &mut NodeRegistry) {
    let _ = registry.register("Code", Arc::new(|p| Box::new(CodeNode::new(p))), true);
}

/// Runs a function from `ctx.resources.code_funcs` over each item and merges
/// the produced fields back in.
///
/// Params:
/// - `function`: whitelist name; calls outside the whitelist are rejected.
///   When omitted, the default narrative context builder runs.
/// - `outputs`: advisory list of fields the function is expected to set.
///   Only listed fields merge back; a missing one is logged, not enforced.
pub struct CodeNode {
    params: Value,
}

impl CodeNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FlowNode for CodeNode {
    fn type_name(&self) -> &'static str {
        "Code"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let fn_name = self.params.get("function").and_then(Value::as_str);
        let outputs: Option<Vec<String>> = self.params.get("outputs").and_then(|v| {
            v.as_array().map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
        });

        let func: CodeFunc = match fn_name {
            Some(name) => ctx
                .resources
                .code_funcs
                .get(name)
                .cloned()
                .ok_or_else(|| NodeError::UnknownFunction {
                    name: name.to_string(),
                })?,
            None => Arc::new(funcs::build_narrative_messages),
        };
        let label = fn_name.unwrap_or("build_narrative_messages");

        let mut result = NodeResult::default();
        for item in items {
            match func(item, ctx) {
                Ok(produced) => {
                    let mut out = item.clone();
                    match &outputs {
                        Some(declared) => {
                            for key in declared {
                                match produced.get(key) {
                                    Some(value) => {
                                        out.insert(key.clone(), value.clone());
                                    }
                                    None => result.log(format!(
                                        "Code: '{label}' did not produce declared output '{key}'"
                                    )),
                                }
                            }
                        }
                        None => out.extend(produced),
                    }
                    result.items.push(out);
                    result.log(format!("Code: applied {label}"));
                }
                Err(err) => {
                    result.items.push(item.clone());
                    result.log(format!("Code error: {err}"));
                }
            }
        }
        Ok(result)
    }
}
