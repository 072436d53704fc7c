use crate::item::{clone_items, Item};
use crate::llm::LlmAdapter;
use crate::state::StateManager;
use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Metrics emitted by a node run: counters and timings keyed by name.
pub type Metrics = FxHashMap<String, Value>;

/// A whitelisted function callable from a `Code` node.
///
/// The function receives one item and the node context and returns the
/// fields it produced; the node decides how those merge back into the item.
pub type CodeFunc = Arc<dyn Fn(&Item, &NodeContext) -> Result<Item, NodeError> + Send + Sync>;

/// Shared services a node may reach through its context.
#[derive(Clone, Default)]
pub struct Resources {
    /// The language-model adapter, when one is wired in.
    pub llm: Option<Arc<dyn LlmAdapter>>,
    /// Whitelist of functions callable from `Code` nodes.
    pub code_funcs: FxHashMap<String, CodeFunc>,
}

impl Resources {
    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmAdapter>) -> Self {
        self.llm = Some(llm);
        self
    }

    #[must_use]
    pub fn with_code_func(mut self, name: impl Into<String>, func: CodeFunc) -> Self {
        self.code_funcs.insert(name.into(), func);
        self
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("llm", &self.llm.is_some())
            .field("code_funcs", &self.code_funcs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Execution context passed to every node.
///
/// Binds a run to its session, branch, and round, and hands the node its
/// state manager and shared resources. Contexts are cheap to clone; the
/// state manager and resources are shared behind `Arc`.
#[derive(Clone, Debug)]
pub struct NodeContext {
    /// Session this run belongs to.
    pub session_id: String,
    /// Branch this run belongs to.
    pub branch_id: String,
    /// Round number anchoring this run; 0 for ad-hoc flow runs.
    pub round_no: u64,
    /// The session's Working/LSS state.
    pub state: Arc<StateManager>,
    /// Shared services (LLM adapter, code function whitelist).
    pub resources: Arc<Resources>,
}

impl NodeContext {
    /// Builds a context for an ad-hoc run outside any chat round.
    #[must_use]
    pub fn detached(state: Arc<StateManager>, resources: Arc<Resources>) -> Self {
        Self {
            session_id: "adhoc".to_string(),
            branch_id: String::new(),
            round_no: 0,
            state,
            resources,
        }
    }

    /// Replaces the state manager, keeping everything else.
    ///
    /// Used by the executor for subflows that opt out of state sharing.
    #[must_use]
    pub fn with_state(&self, state: Arc<StateManager>) -> Self {
        let mut ctx = self.clone();
        ctx.state = state;
        ctx
    }
}

/// The result of running one node: output items plus observability.
///
/// Logs accumulate along composite execution; metrics shallow-merge with
/// numeric summation on collisions. A non-empty `errors` marks the run as a
/// node failure, which aborts the enclosing Sequence.
#[derive(Clone, Debug, Default)]
pub struct NodeResult {
    pub items: Vec<Item>,
    pub logs: Vec<String>,
    pub metrics: Metrics,
    pub errors: Vec<String>,
}

impl NodeResult {
    #[must_use]
    pub fn with_items(items: Vec<Item>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    /// True when the run should be treated as a node failure.
    #[must_use]
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Errors a node can raise. These are captured by [`safe_run`] rather than
/// propagated, so a misbehaving node degrades to logs instead of tearing
/// down the whole flow.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input data is missing from the item or parameters.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(taleloom::node::missing_input),
        help("Check the node's params and the fields produced upstream.")
    )]
    MissingInput { what: &'static str },

    /// A parameter is present but malformed.
    #[error("invalid params: {message}")]
    #[diagnostic(code(taleloom::node::invalid_params))]
    InvalidParams { message: String },

    /// A `Code` node referenced a function outside the whitelist.
    #[error("unknown code function '{name}'")]
    #[diagnostic(
        code(taleloom::node::unknown_function),
        help("Only functions registered in ctx.resources.code_funcs may be called.")
    )]
    UnknownFunction { name: String },

    /// Expression compilation or evaluation failed.
    #[error(transparent)]
    #[diagnostic(code(taleloom::node::expression))]
    Expression(#[from] crate::expr::ExprError),

    /// JSON conversion failed.
    #[error(transparent)]
    #[diagnostic(code(taleloom::node::serde_json))]
    Serde(#[from] serde_json::Error),
}

/// An atomic workflow node: a pure items-to-items transform.
///
/// Implementations must not mutate their input sequence; they clone what
/// they keep and return a fresh one. Long suspensions are only expected at
/// the LLM adapter call.
#[async_trait]
pub trait FlowNode: Send + Sync {
    /// The registry name this node answers to.
    fn type_name(&self) -> &'static str;

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError>;
}

/// Runs a node, converting failures into a degraded [`NodeResult`] and
/// stamping the standard metrics (`type`, `duration_ms`, `items_in`,
/// `items_out`).
///
/// On error the input items pass through unchanged and the error lands in
/// both `logs` and `errors`; the executor uses `errors` to decide whether
/// the enclosing Sequence continues.
pub async fn safe_run(node: &dyn FlowNode, items: &[Item], ctx: &NodeContext) -> NodeResult {
    let start = Instant::now();
    let items_in = items.len();
    let mut result = match node.run(items, ctx).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(node = node.type_name(), error = %err, "node failed");
            let mut degraded = NodeResult::with_items(clone_items(items));
            degraded.log(format!("error:{err}"));
            degraded.errors.push(err.to_string());
            degraded
        }
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let metrics = &mut result.metrics;
    metrics
        .entry("type".to_string())
        .or_insert_with(|| Value::String(node.type_name().to_string()));
    metrics
        .entry("duration_ms".to_string())
        .or_insert_with(|| Value::from(elapsed_ms));
    metrics
        .entry("items_in".to_string())
        .or_insert_with(|| Value::from(items_in as u64));
    metrics
        .entry("items_out".to_string())
        .or_insert_with(|| Value::from(result.items.len() as u64));
    result
}
