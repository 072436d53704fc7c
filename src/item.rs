//! The items bus: the unit of data flowing between nodes.
//!
//! Every node consumes and produces an ordered sequence of [`Item`] records.
//! An item is an extensible string-keyed map of dynamic JSON values, the same
//! shape as a chat turn's scratch data. Nodes never mutate their input; they
//! clone what they keep and emit a fresh sequence.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// A single record on the items bus.
pub type Item = FxHashMap<String, Value>;

/// Creates an empty item with the crate's standard hasher.
#[must_use]
pub fn new_item() -> Item {
    FxHashMap::default()
}

/// Creates a single-field item.
#[must_use]
pub fn item_with(key: impl Into<String>, value: Value) -> Item {
    let mut item = new_item();
    item.insert(key.into(), value);
    item
}

/// Clones an item sequence field-by-field.
///
/// `Value` clones are deep, so the result shares no structure with the input.
#[must_use]
pub fn clone_items(items: &[Item]) -> Vec<Item> {
    items.to_vec()
}

/// Returns the first item's value at `key` as a string, if present.
///
/// Non-string scalars are rendered with their JSON display form; `null`
/// yields `None`. Used wherever a reply field has to be surfaced as text.
#[must_use]
pub fn first_string(items: &[Item], key: &str) -> Option<String> {
    let value = items.first()?.get(key)?;
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
