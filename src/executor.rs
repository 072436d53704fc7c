//! The workflow executor: interprets composite semantics and dispatches
//! atomic nodes.
//!
//! Composites are interpreted here rather than registered as nodes:
//!
//! - **Sequence** threads items left to right through its children and
//!   aborts on the first node failure, returning what was produced so far
//! - **If** evaluates its condition against `{item, items, state}` and runs
//!   the selected arm as an implicit Sequence
//! - **Subflow** maps parent items into a referenced document, runs it
//!   inline, and maps named child fields back out
//!
//! Everything else is looked up in the registry and run through
//! [`safe_run`], so a failing node degrades to logs instead of an error.

use crate::expr;
use crate::ir::{IrDoc, IrLoader, NodeSpec};
use crate::item::Item;
use crate::node::{safe_run, Metrics, NodeContext, NodeResult};
use crate::registry::NodeRegistry;
use crate::state::StateManager;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Subflow nesting limit.
pub const MAX_SUBFLOW_DEPTH: usize = 16;

/// Node types interpreted by the executor itself rather than dispatched
/// through the registry.
pub const COMPOSITE_TYPES: [&str; 3] = ["Sequence", "If", "Subflow"];

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Flow(#[from] crate::ir::IrError),

    #[error("subflow depth {depth} exceeds the limit of {MAX_SUBFLOW_DEPTH} at '{reference}'")]
    #[diagnostic(
        code(taleloom::executor::subflow_depth),
        help("Check the subflow graph for a reference cycle.")
    )]
    SubflowDepth { reference: String, depth: usize },
}

/// Interprets IR documents against a registry and loader snapshot.
///
/// The executor owns `Arc` handles, so it stays valid across a concurrent
/// reload; in-flight runs finish against the index they started with.
#[derive(Clone)]
pub struct FlowExecutor {
    registry: Arc<NodeRegistry>,
    loader: Arc<IrLoader>,
}

impl FlowExecutor {
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, loader: Arc<IrLoader>) -> Self {
        Self { registry, loader }
    }

    /// Runs a registered flow by reference (`id@version`, or bare id).
    #[tracing::instrument(skip(self, items, ctx), fields(session = %ctx.session_id))]
    pub async fn run_ref(
        &self,
        reference: &str,
        items: Vec<Item>,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecutorError> {
        let doc = self.loader.get(reference)?;
        self.run_doc_at(&doc, items, ctx, 0).await
    }

    /// Runs an unregistered document directly.
    pub async fn run_doc(
        &self,
        doc: &IrDoc,
        items: Vec<Item>,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecutorError> {
        self.run_doc_at(doc, items, ctx, 0).await
    }

    /// Schema plus referential check only; no execution.
    pub fn validate(&self, doc: &IrDoc) -> Result<(), crate::ir::IrError> {
        doc.validate()
    }

    async fn run_doc_at(
        &self,
        doc: &IrDoc,
        items: Vec<Item>,
        ctx: &NodeContext,
        depth: usize,
    ) -> Result<NodeResult, ExecutorError> {
        doc.validate()?;
        let node_map = doc.node_map();
        let Some(entry) = node_map.get(doc.entry.as_str()).copied() else {
            return Err(crate::ir::IrError::Validation {
                message: "entry not found".to_string(),
            }
            .into());
        };
        self.run_spec(entry, &node_map, items, ctx, depth).await
    }

    fn run_spec<'a>(
        &'a self,
        spec: &'a NodeSpec,
        node_map: &'a FxHashMap<&'a str, &'a NodeSpec>,
        items: Vec<Item>,
        ctx: &'a NodeContext,
        depth: usize,
    ) -> BoxFuture<'a, Result<NodeResult, ExecutorError>> {
        async move {
            match spec.node_type.as_str() {
                "Sequence" => {
                    let children = spec.children.as_deref().unwrap_or_default();
                    let mut child_ids: Vec<&str> = Vec::with_capacity(children.len());
                    for id in children {
                        child_ids.push(id.as_str());
                    }
                    self.run_children(&child_ids, node_map, items, ctx, depth, "Sequence")
                        .await
                }
                "If" => {
                    let Some(cond) = spec.if_spec.as_ref() else {
                        return Ok(malformed(items, &spec.id, "missing 'if' record"));
                    };
                    let state = serde_json::to_value(ctx.state.get_for_prompt())
                        .unwrap_or(Value::Null);
                    let (truthy, cond_log) =
                        match expr::eval_condition(&cond.cond, &items, &state) {
                            Ok(result) => (result, None),
                            // a broken condition selects the else arm, logged
                            Err(err) => (false, Some(format!("If[{}] error: {err}", spec.id))),
                        };
                    let arm = if truthy { &cond.then } else { &cond.otherwise };
                    let arm_ids: Vec<&str> = arm.iter().map(String::as_str).collect();
                    let mut result = self
                        .run_children(&arm_ids, node_map, items, ctx, depth, "If")
                        .await?;
                    let mut logs = vec![format!(
                        "If[{}] condition={}",
                        spec.id,
                        if truthy { "then" } else { "else" }
                    )];
                    if let Some(line) = cond_log {
                        logs.push(line);
                    }
                    logs.append(&mut result.logs);
                    result.logs = logs;
                    Ok(result)
                }
                "Subflow" => self.run_subflow(spec, items, ctx, depth).await,
                atomic => {
                    let result = match self.registry.instantiate(atomic, spec.params()) {
                        Ok(node) => safe_run(node.as_ref(), &items, ctx).await,
                        Err(err) => {
                            // unknown or broken type degrades like a failing node
                            let mut degraded = NodeResult::with_items(items);
                            degraded.log(format!("error:{err}"));
                            degraded.errors.push(err.to_string());
                            degraded
                        }
                    };
                    Ok(result)
                }
            }
        }
        .boxed()
    }

    /// Runs an id list as an implicit sequence, threading items and
    /// accumulating logs/metrics. Aborts after the first failed child,
    /// keeping the last successful items.
    async fn run_children(
        &self,
        child_ids: &[&str],
        node_map: &FxHashMap<&str, &NodeSpec>,
        items: Vec<Item>,
        ctx: &NodeContext,
        depth: usize,
        kind: &str,
    ) -> Result<NodeResult, ExecutorError> {
        let mut out = NodeResult::default();
        out.metrics
            .insert("type".to_string(), Value::String(kind.to_string()));
        let mut current = items;
        for child_id in child_ids {
            let Some(&child) = node_map.get(child_id) else {
                out.log(format!("error:unknown node id '{child_id}'"));
                out.errors.push(format!("unknown node id '{child_id}'"));
                break;
            };
            let mut result = self
                .run_spec(child, node_map, current.clone(), ctx, depth)
                .await?;
            out.logs.append(&mut result.logs);
            merge_metrics(&mut out.metrics, &result.metrics);
            if result.failed() {
                out.errors.append(&mut result.errors);
                current = result.items;
                break;
            }
            current = result.items;
        }
        out.metrics.insert(
            "items_out".to_string(),
            Value::from(current.len() as u64),
        );
        out.items = current;
        Ok(out)
    }

    async fn run_subflow(
        &self,
        spec: &NodeSpec,
        items: Vec<Item>,
        ctx: &NodeContext,
        depth: usize,
    ) -> Result<NodeResult, ExecutorError> {
        let Some(sf) = spec.subflow.as_ref() else {
            return Ok(malformed(items, &spec.id, "missing 'subflow' record"));
        };
        let reference = sf.reference.to_string();
        if depth + 1 > MAX_SUBFLOW_DEPTH {
            return Err(ExecutorError::SubflowDepth {
                reference,
                depth: depth + 1,
            });
        }

        let mapped: Vec<Item> = items
            .iter()
            .map(|item| {
                let mut child_item = if sf.share_items {
                    item.clone()
                } else {
                    Item::default()
                };
                for (src, dest) in &sf.input_map {
                    if let Some(value) = item.get(src) {
                        child_item.insert(dest.clone(), value.clone());
                    }
                }
                child_item
            })
            .collect();

        let child_ctx = if sf.share_state {
            ctx.clone()
        } else {
            ctx.with_state(Arc::new(StateManager::new(ctx.state.get_working_state())))
        };

        tracing::debug!(subflow = %reference, share_state = sf.share_state, "entering subflow");
        let child_doc = self.loader.get(&reference)?;
        let mut child_result = self
            .run_doc_at(&child_doc, mapped, &child_ctx, depth + 1)
            .await?;

        let mut out = NodeResult::default();
        out.logs.append(&mut child_result.logs);
        if child_result.failed() {
            out.log(format!("Subflow[{reference}] failed"));
            out.errors.append(&mut child_result.errors);
            out.items = items;
            out.metrics
                .insert("type".to_string(), Value::String("Subflow".to_string()));
            return Ok(out);
        }

        out.items = if sf.output_map.is_empty() {
            child_result.items
        } else {
            let mut merged: Vec<Item> = Vec::new();
            let n = items.len().min(child_result.items.len());
            for i in 0..n {
                let mut base = items[i].clone();
                for (src, dest) in &sf.output_map {
                    if let Some(value) = child_result.items[i].get(src) {
                        base.insert(dest.clone(), value.clone());
                    }
                }
                merged.push(base);
            }
            merged.extend(child_result.items.into_iter().skip(n));
            merged
        };
        out.log(format!("Subflow[{reference}] executed"));
        merge_metrics(&mut out.metrics, &child_result.metrics);
        out.metrics
            .insert("type".to_string(), Value::String("Subflow".to_string()));
        out.metrics.insert(
            "items_out".to_string(),
            Value::from(out.items.len() as u64),
        );
        Ok(out)
    }
}

/// A composite node missing its record, degraded like a failing node.
fn malformed(items: Vec<Item>, node_id: &str, what: &str) -> NodeResult {
    let mut degraded = NodeResult::with_items(items);
    let message = format!("node '{node_id}' {what}");
    degraded.log(format!("error:{message}"));
    degraded.errors.push(message);
    degraded
}

/// Shallow metric merge: numeric values sum when both sides are numeric,
/// otherwise the later value wins.
pub fn merge_metrics(into: &mut Metrics, from: &Metrics) {
    for (key, value) in from {
        match (into.get(key), value) {
            (Some(Value::Number(a)), Value::Number(b)) => {
                let merged = match (a.as_i64(), b.as_i64()) {
                    (Some(x), Some(y)) => Value::from(x + y),
                    _ => Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
                };
                into.insert(key.clone(), merged);
            }
            _ => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}
