//! Workflow IR documents: model, loader, and validation.
//!
//! A document declares an entry node and a flat list of node definitions
//! that reference each other by id. Two on-disk encodings are accepted,
//! brace-delimited (`.json`) and tag-delimited (`.yaml`/`.yml`); both
//! deserialize into the same [`IrDoc`], so everything downstream is
//! encoding-independent.
//!
//! Documents are indexed by `id@version`. Resolving a bare id picks the
//! highest registered version.

use crate::types::FlowRef;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IrError {
    #[error("IR validation failed: {message}")]
    #[diagnostic(
        code(taleloom::ir::validation),
        help("Check entry/node ids and that composite fields match their node type.")
    )]
    Validation { message: String },

    #[error("flow not found: {reference}")]
    #[diagnostic(code(taleloom::ir::not_found))]
    NotFound { reference: String },

    #[error("failed to read IR file {path}: {source}")]
    #[diagnostic(code(taleloom::ir::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse IR file {path}: {message}")]
    #[diagnostic(code(taleloom::ir::parse))]
    Parse { path: PathBuf, message: String },
}

impl IrError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// The `if` record on an `If` node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IfSpec {
    /// JMESPath predicate over `{item, items, state}`.
    pub cond: String,
    pub then: Vec<String>,
    #[serde(default, rename = "else")]
    pub otherwise: Vec<String>,
}

/// The `subflow` record on a `Subflow` node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubflowSpec {
    /// Referenced document, `id@version`. Resolved lazily at execution.
    #[serde(rename = "ref")]
    pub reference: FlowRef,
    /// Parent item field to child item field.
    #[serde(default)]
    pub input_map: FxHashMap<String, String>,
    /// Child item field to parent item field.
    #[serde(default)]
    pub output_map: FxHashMap<String, String>,
    /// Pass unmapped parent fields through to the child. Default false:
    /// the child sees a fresh item carrying only mapped fields.
    #[serde(default)]
    pub share_items: bool,
    /// Child inherits the parent's state manager. Default true; false gives
    /// the child a scratch copy discarded on exit.
    #[serde(default = "default_true")]
    pub share_state: bool,
}

fn default_true() -> bool {
    true
}

/// One node definition inside a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Child ids, Sequence only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
    /// Condition record, If only.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_spec: Option<IfSpec>,
    /// Subflow record, Subflow only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow: Option<SubflowSpec>,
}

impl NodeSpec {
    #[must_use]
    pub fn params(&self) -> Value {
        self.params.clone().unwrap_or(Value::Null)
    }
}

/// A workflow document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IrDoc {
    pub id: String,
    pub version: u32,
    pub entry: String,
    pub nodes: Vec<NodeSpec>,
}

impl IrDoc {
    #[must_use]
    pub fn reference(&self) -> FlowRef {
        FlowRef::new(self.id.clone(), self.version)
    }

    /// Node id to definition. Duplicates are rejected by [`validate`].
    ///
    /// [`validate`]: Self::validate
    #[must_use]
    pub fn node_map(&self) -> FxHashMap<&str, &NodeSpec> {
        self.nodes
            .iter()
            .map(|spec| (spec.id.as_str(), spec))
            .collect()
    }

    /// Schema and referential checks: unique ids, defined entry, defined
    /// child references, composite fields matching the node type.
    pub fn validate(&self) -> Result<(), IrError> {
        if self.id.is_empty() {
            return Err(IrError::validation("document requires 'id'"));
        }
        if self.version < 1 {
            return Err(IrError::validation("version must be >= 1"));
        }

        let mut ids: HashSet<&str> = HashSet::new();
        for spec in &self.nodes {
            if spec.id.is_empty() {
                return Err(IrError::validation("node missing 'id'"));
            }
            if spec.node_type.trim().is_empty() {
                return Err(IrError::validation(format!(
                    "node '{}' missing 'type'",
                    spec.id
                )));
            }
            if !ids.insert(spec.id.as_str()) {
                return Err(IrError::validation(format!("duplicate node id: {}", spec.id)));
            }
        }

        if self.entry.is_empty() || !ids.contains(self.entry.as_str()) {
            return Err(IrError::validation("entry not found"));
        }

        for spec in &self.nodes {
            match spec.node_type.as_str() {
                "Sequence" => {
                    for child in spec.children.as_deref().unwrap_or_default() {
                        if !ids.contains(child.as_str()) {
                            return Err(IrError::validation(format!(
                                "Sequence '{}' references unknown id '{child}'",
                                spec.id
                            )));
                        }
                    }
                }
                "If" => {
                    let Some(cond) = &spec.if_spec else {
                        return Err(IrError::validation(format!(
                            "If '{}' requires an 'if' record",
                            spec.id
                        )));
                    };
                    if cond.cond.trim().is_empty() {
                        return Err(IrError::validation(format!(
                            "If '{}' requires a non-empty condition",
                            spec.id
                        )));
                    }
                    for child in cond.then.iter().chain(&cond.otherwise) {
                        if !ids.contains(child.as_str()) {
                            return Err(IrError::validation(format!(
                                "If '{}' references unknown id '{child}'",
                                spec.id
                            )));
                        }
                    }
                }
                "Subflow" => {
                    if spec.subflow.is_none() {
                        return Err(IrError::validation(format!(
                            "Subflow '{}' requires a 'subflow' record",
                            spec.id
                        )));
                    }
                }
                _ => {
                    if spec.children.is_some() {
                        return Err(IrError::validation(format!(
                            "'children' is only valid on Sequence (node '{}')",
                            spec.id
                        )));
                    }
                    if spec.if_spec.is_some() {
                        return Err(IrError::validation(format!(
                            "'if' is only valid on If (node '{}')",
                            spec.id
                        )));
                    }
                    if spec.subflow.is_some() {
                        return Err(IrError::validation(format!(
                            "'subflow' is only valid on Subflow (node '{}')",
                            spec.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Loads, validates, and indexes IR documents from disk.
#[derive(Default)]
pub struct IrLoader {
    flows: FxHashMap<String, Arc<IrDoc>>,
}

impl IrLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recursively loads every `.json`/`.yaml`/`.yml` under the given
    /// directories. Invalid files are logged and skipped; returns the
    /// number of documents registered.
    pub fn load_dirs<P: AsRef<Path>>(&mut self, dirs: impl IntoIterator<Item = P>) -> usize {
        let mut count = 0;
        for dir in dirs {
            let dir = dir.as_ref();
            if !dir.exists() {
                tracing::info!(dir = %dir.display(), "skipping missing IR directory");
                continue;
            }
            count += self.load_dir_recursive(dir);
        }
        tracing::info!(count, "IR documents loaded");
        count
    }

    fn load_dir_recursive(&mut self, dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else {
            tracing::warn!(dir = %dir.display(), "failed to read IR directory");
            return 0;
        };
        let mut count = 0;
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();
        for path in paths {
            if path.is_dir() {
                count += self.load_dir_recursive(&path);
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !matches!(ext, "json" | "yaml" | "yml") {
                continue;
            }
            match self.load_file(&path) {
                Ok(reference) => {
                    tracing::debug!(flow = %reference, path = %path.display(), "loaded IR");
                    count += 1;
                }
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "invalid IR file");
                }
            }
        }
        count
    }

    /// Loads and registers one document, returning its reference.
    pub fn load_file(&mut self, path: &Path) -> Result<FlowRef, IrError> {
        let text = std::fs::read_to_string(path).map_err(|source| IrError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let doc: IrDoc = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&text).map_err(|e| IrError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            _ => serde_json::from_str(&text).map_err(|e| IrError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
        };
        self.register(doc)
    }

    /// Validates and indexes a document under `id@version`.
    pub fn register(&mut self, doc: IrDoc) -> Result<FlowRef, IrError> {
        doc.validate()?;
        let reference = doc.reference();
        self.flows.insert(reference.to_string(), Arc::new(doc));
        Ok(reference)
    }

    /// Resolves `id@version`, or a bare `id` to its highest version.
    pub fn get(&self, reference: &str) -> Result<Arc<IrDoc>, IrError> {
        if let Some(doc) = self.flows.get(reference) {
            return Ok(doc.clone());
        }
        if !reference.contains('@') {
            let best = self
                .flows
                .values()
                .filter(|doc| doc.id == reference)
                .max_by_key(|doc| doc.version);
            if let Some(doc) = best {
                return Ok(doc.clone());
            }
        }
        Err(IrError::NotFound {
            reference: reference.to_string(),
        })
    }

    /// All registered references, sorted.
    #[must_use]
    pub fn list_flows(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.flows.keys().cloned().collect();
        refs.sort();
        refs
    }
}
