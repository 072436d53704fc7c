//! The node registry: type name to node constructor.
//!
//! The registry is built once at engine init by walking the fixed set of
//! node providers under [`crate::nodes`], and is swapped wholesale on
//! reload. Lookups are case-sensitive. Registering a name twice is an error
//! unless `override` is requested, which only reload does.

use crate::node::FlowNode;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Builds a node instance from its IR `params` record.
pub type NodeCtor = Arc<dyn Fn(Value) -> Box<dyn FlowNode> + Send + Sync>;

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("node type '{name}' already registered")]
    #[diagnostic(
        code(taleloom::registry::conflict),
        help("Pass override=true only from reload; pick a distinct type_name otherwise.")
    )]
    Conflict { name: String },

    #[error("unknown node type '{name}'. Known: {known}")]
    #[diagnostic(code(taleloom::registry::unknown_type))]
    UnknownType { name: String, known: String },

    #[error("node type name must be non-empty")]
    #[diagnostic(code(taleloom::registry::empty_name))]
    EmptyName,
}

/// Registry of atomic node constructors.
#[derive(Default)]
pub struct NodeRegistry {
    ctors: FxHashMap<String, NodeCtor>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry populated with every built-in node provider.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.discover();
        registry
    }

    /// Walks the fixed provider set and registers everything it declares.
    ///
    /// Providers register with override semantics so a rebuilt registry
    /// never trips over its own previous contents. Returns the number of
    /// registered types.
    pub fn discover(&mut self) -> usize {
        let before = self.ctors.len();
        crate::nodes::register_builtin(self);
        tracing::debug!(total = self.ctors.len(), "node discovery completed");
        self.ctors.len() - before
    }

    /// Registers a constructor under `type_name`.
    pub fn register(
        &mut self,
        type_name: &str,
        ctor: NodeCtor,
        override_existing: bool,
    ) -> Result<(), RegistryError> {
        if type_name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if !override_existing && self.ctors.contains_key(type_name) {
            return Err(RegistryError::Conflict {
                name: type_name.to_string(),
            });
        }
        self.ctors.insert(type_name.to_string(), ctor);
        Ok(())
    }

    /// Instantiates a node of `type_name` with the given params.
    pub fn instantiate(
        &self,
        type_name: &str,
        params: Value,
    ) -> Result<Box<dyn FlowNode>, RegistryError> {
        let ctor = self
            .ctors
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownType {
                name: type_name.to_string(),
                known: if self.ctors.is_empty() {
                    "<none>".to_string()
                } else {
                    self.known_types().join(", ")
                },
            })?;
        Ok(ctor(params))
    }

    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.ctors.contains_key(type_name)
    }

    /// All registered type names, sorted.
    #[must_use]
    pub fn known_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.known_types())
            .finish()
    }
}
