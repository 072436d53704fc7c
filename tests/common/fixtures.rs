use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use taleloom::config::EngineConfig;
use taleloom::engine::Engine;
use taleloom::ir::{IrDoc, IrLoader};
use taleloom::item::Item;
use taleloom::llm::MockLlmAdapter;
use taleloom::node::{NodeContext, Resources};
use taleloom::registry::NodeRegistry;
use taleloom::state::{StateManager, StateMap};

/// The crate's bundled flow documents (main@1, postprocess@1, guidance@1,
/// summarize@1).
pub fn bundled_flow_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("flows")
}

/// Engine config rooted in a temp directory, with the mock adapter, fast
/// retries, and the bundled flows.
pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage_dir = dir.join("sessions");
    config.flow_dirs = vec![bundled_flow_dir()];
    config.poll_interval_ms = 10;
    config.worker.backoff_base_ms = 1;
    config
}

pub fn test_engine(dir: &Path) -> Arc<Engine> {
    Arc::new(Engine::new(test_config(dir)).expect("engine builds"))
}

/// Parses an inline JSON value into a document.
pub fn doc(value: Value) -> IrDoc {
    serde_json::from_value(value).expect("doc parses")
}

/// A loader preloaded with the given documents.
pub fn loader_with(docs: impl IntoIterator<Item = IrDoc>) -> Arc<IrLoader> {
    let mut loader = IrLoader::new();
    for d in docs {
        loader.register(d).expect("doc registers");
    }
    Arc::new(loader)
}

pub fn builtin_registry() -> Arc<NodeRegistry> {
    Arc::new(NodeRegistry::with_builtin())
}

/// Detached node context with the mock adapter and the given state.
pub fn mock_ctx(state: StateMap) -> NodeContext {
    NodeContext::detached(
        Arc::new(StateManager::new(state)),
        Arc::new(Resources::default().with_llm(Arc::new(MockLlmAdapter))),
    )
}

pub fn item_of(value: Value) -> Item {
    serde_json::from_value(value).expect("item parses")
}

/// A Sequence document whose children are Map nodes setting the listed
/// fields to literal values.
pub fn map_chain_doc(id: &str, fields: &[(&str, i64)]) -> IrDoc {
    let mut nodes = vec![json!({
        "id": "chain",
        "type": "Sequence",
        "children": fields.iter().map(|(name, _)| format!("set_{name}")).collect::<Vec<_>>()
    })];
    for (name, value) in fields {
        let mut set = serde_json::Map::new();
        set.insert(name.to_string(), json!(format!("`{value}`")));
        nodes.push(json!({
            "id": format!("set_{name}"),
            "type": "Map",
            "params": { "set": set }
        }));
    }
    doc(json!({ "id": id, "version": 1, "entry": "chain", "nodes": nodes }))
}
