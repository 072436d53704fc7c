//! Built-in atomic nodes and their registration providers.
//!
//! Each submodule is one provider namespace; [`register_builtin`] walks the
//! fixed set and registers every concrete node by its declared type name.
//! Plug-in nodes follow the same shape: expose a `register(&mut NodeRegistry)`
//! and add it to the provider list at engine init.

pub mod code;
pub mod llm;
pub mod state;
pub mod transform;

use crate::registry::NodeRegistry;
use serde_json::Value;

/// Registers every built-in node provider into `registry`.
pub fn register_builtin(registry: &mut NodeRegistry) {
    for provider in [
        code::register,
        llm::register,
        state::register,
        transform::register,
    ] {
        provider(registry);
    }
}

// Param accessors shared by the node implementations. Params arrive as the
// raw IR `params` record; missing or mistyped fields fall back to defaults.

pub(crate) fn param_str(params: &Value, key: &str, default: &str) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

pub(crate) fn param_bool(params: &Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub(crate) fn param_i64(params: &Value, key: &str, default: i64) -> i64 {
    params.get(key).and_then(Value::as_i64).unwrap_or(default)
}

pub(crate) fn param_object(params: &Value, key: &str) -> Vec<(String, Value)> {
    params
        .get(key)
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}
