//! Expression evaluation for If conditions and Map/Filter/Split parameters.
//!
//! The only evaluator is JMESPath. Expressions run against a synthesized
//! scope so a condition can reach the current item, the whole sequence, and
//! the prompt view of state:
//!
//! ```text
//! { "item": {...first item...}, "items": [...], "state": {...} }
//! ```
//!
//! Map/Filter/Split expressions evaluate against the bare item instead.
//! Anything outside the JMESPath grammar is rejected at compile time, so no
//! host-language code can ever run inside a workflow document.

use crate::item::Item;
use miette::Diagnostic;
use serde_json::{json, Value};
use thiserror::Error;

/// Error raised when an expression fails to compile or evaluate.
#[derive(Debug, Error, Diagnostic)]
pub enum ExprError {
    #[error("invalid expression '{expr}': {message}")]
    #[diagnostic(
        code(taleloom::expr::compile),
        help("Expressions use JMESPath syntax, e.g. \"item.turn_count > `3`\".")
    )]
    Compile { expr: String, message: String },

    #[error("expression '{expr}' failed: {message}")]
    #[diagnostic(code(taleloom::expr::eval))]
    Eval { expr: String, message: String },
}

fn compile(expr: &str) -> Result<jmespath::Expression<'static>, ExprError> {
    jmespath::compile(expr).map_err(|e| ExprError::Compile {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

/// Evaluates `expr` against an arbitrary JSON scope, returning plain JSON.
pub fn search(expr: &str, scope: &Value) -> Result<Value, ExprError> {
    let compiled = compile(expr)?;
    let data = jmespath::Variable::from_serializable(scope).map_err(|e| ExprError::Eval {
        expr: expr.to_string(),
        message: e.to_string(),
    })?;
    let result = compiled.search(data).map_err(|e| ExprError::Eval {
        expr: expr.to_string(),
        message: e.to_string(),
    })?;
    serde_json::to_value(result.as_ref()).map_err(|e| ExprError::Eval {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

/// Evaluates `expr` against a single item.
pub fn search_item(expr: &str, item: &Item) -> Result<Value, ExprError> {
    search(expr, &serde_json::to_value(item).unwrap_or(Value::Null))
}

/// Builds the `{item, items, state}` scope used by If conditions.
#[must_use]
pub fn condition_scope(items: &[Item], state: &Value) -> Value {
    let first = items
        .first()
        .map(|it| serde_json::to_value(it).unwrap_or(Value::Null))
        .unwrap_or_else(|| json!({}));
    json!({
        "item": first,
        "items": items,
        "state": state,
    })
}

/// Evaluates a boolean condition over the `{item, items, state}` scope.
pub fn eval_condition(expr: &str, items: &[Item], state: &Value) -> Result<bool, ExprError> {
    let scope = condition_scope(items, state);
    Ok(truthy(&search(expr, &scope)?))
}

/// JMESPath truthiness: null, false, empty string/array/object are false.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::item_with;

    #[test]
    fn search_extracts_nested_paths() {
        let scope = json!({"a": {"b": [10, 20]}});
        assert_eq!(search("a.b[1]", &scope).unwrap(), json!(20));
        assert_eq!(search("a.missing", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn conditions_see_item_items_and_state() {
        let items = vec![item_with("user_input", json!("attack"))];
        let state = json!({"turn_count": 4});
        assert!(eval_condition("item.user_input == 'attack'", &items, &state).unwrap());
        assert!(eval_condition("state.turn_count > `3`", &items, &state).unwrap());
        assert!(!eval_condition("length(items) > `1`", &items, &state).unwrap());
    }

    #[test]
    fn invalid_syntax_is_a_compile_error() {
        let err = search("item..", &json!({})).unwrap_err();
        assert!(matches!(err, ExprError::Compile { .. }));
    }

    #[test]
    fn truthiness_follows_jmespath_rules() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!(0)));
        assert!(truthy(&json!("x")));
    }
}
