mod common;

use common::*;
use serde_json::json;
use taleloom::executor::{ExecutorError, FlowExecutor, MAX_SUBFLOW_DEPTH};
use taleloom::state::StateMap;

fn executor_with(docs: Vec<taleloom::ir::IrDoc>) -> FlowExecutor {
    FlowExecutor::new(builtin_registry(), loader_with(docs))
}

#[tokio::test]
async fn sequence_threads_items_left_to_right() {
    let executor = executor_with(vec![map_chain_doc("chain", &[("a", 1), ("b", 2)])]);
    let ctx = mock_ctx(StateMap::default());
    let result = executor
        .run_ref("chain@1", vec![item_of(json!({}))], &ctx)
        .await
        .unwrap();
    assert!(!result.failed());
    assert_eq!(result.items[0]["a"], json!(1));
    assert_eq!(result.items[0]["b"], json!(2));
}

#[tokio::test]
async fn sequence_aborts_on_node_failure_with_partial_results() {
    // Filter without 'where' is a node failure; the second Map never runs
    let d = doc(json!({
        "id": "abort", "version": 1, "entry": "chain",
        "nodes": [
            {"id": "chain", "type": "Sequence", "children": ["ok", "broken", "after"]},
            {"id": "ok", "type": "Map", "params": {"set": {"x": "`1`"}}},
            {"id": "broken", "type": "Filter"},
            {"id": "after", "type": "Map", "params": {"set": {"y": "`2`"}}}
        ]
    }));
    let executor = executor_with(vec![d]);
    let ctx = mock_ctx(StateMap::default());
    let result = executor
        .run_ref("abort@1", vec![item_of(json!({}))], &ctx)
        .await
        .unwrap();
    assert!(result.failed());
    assert_eq!(result.items[0]["x"], json!(1));
    assert!(!result.items[0].contains_key("y"));
    assert!(result.logs.iter().any(|l| l.starts_with("error:")));
}

#[tokio::test]
async fn empty_item_sequence_still_reaches_the_next_child() {
    // Filter drops everything; Merge still runs and appends its constant
    let d = doc(json!({
        "id": "empty", "version": 1, "entry": "chain",
        "nodes": [
            {"id": "chain", "type": "Sequence", "children": ["drop_all", "append"]},
            {"id": "drop_all", "type": "Filter", "params": {"where": "nope"}},
            {"id": "append", "type": "Merge", "params": {"with": [{"sentinel": true}]}}
        ]
    }));
    let executor = executor_with(vec![d]);
    let ctx = mock_ctx(StateMap::default());
    let result = executor
        .run_ref("empty@1", vec![item_of(json!({"k": 1}))], &ctx)
        .await
        .unwrap();
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0]["sentinel"], json!(true));
}

#[tokio::test]
async fn if_selects_then_and_else_arms() {
    let d = doc(json!({
        "id": "cond", "version": 1, "entry": "gate",
        "nodes": [
            {"id": "gate", "type": "If", "if": {
                "cond": "item.go == 'yes'",
                "then": ["mark_then"],
                "else": ["mark_else"]
            }},
            {"id": "mark_then", "type": "Map", "params": {"set": {"arm": "'then'"}}},
            {"id": "mark_else", "type": "Map", "params": {"set": {"arm": "'else'"}}}
        ]
    }));
    let executor = executor_with(vec![d]);
    let ctx = mock_ctx(StateMap::default());

    let yes = executor
        .run_ref("cond@1", vec![item_of(json!({"go": "yes"}))], &ctx)
        .await
        .unwrap();
    assert_eq!(yes.items[0]["arm"], json!("then"));
    assert!(yes.logs.iter().any(|l| l.contains("condition=then")));

    let no = executor
        .run_ref("cond@1", vec![item_of(json!({"go": "no"}))], &ctx)
        .await
        .unwrap();
    assert_eq!(no.items[0]["arm"], json!("else"));
}

#[tokio::test]
async fn if_sees_state_through_the_prompt_view() {
    let d = doc(json!({
        "id": "state_cond", "version": 1, "entry": "gate",
        "nodes": [
            {"id": "gate", "type": "If", "if": {
                "cond": "state.turn_count > `0`",
                "then": ["mark"],
                "else": []
            }},
            {"id": "mark", "type": "Map", "params": {"set": {"seen": "`1`"}}}
        ]
    }));
    let executor = executor_with(vec![d]);
    let mut state = StateMap::default();
    state.insert("turn_count".into(), json!(3));
    let ctx = mock_ctx(state);
    let result = executor
        .run_ref("state_cond@1", vec![item_of(json!({}))], &ctx)
        .await
        .unwrap();
    assert_eq!(result.items[0]["seen"], json!(1));
}

#[tokio::test]
async fn broken_condition_takes_the_else_arm_and_logs() {
    let d = doc(json!({
        "id": "bad_cond", "version": 1, "entry": "gate",
        "nodes": [
            {"id": "gate", "type": "If", "if": {"cond": "item..", "then": ["mark"], "else": []}},
            {"id": "mark", "type": "Map", "params": {"set": {"seen": "`1`"}}}
        ]
    }));
    let executor = executor_with(vec![d]);
    let ctx = mock_ctx(StateMap::default());
    let result = executor
        .run_ref("bad_cond@1", vec![item_of(json!({}))], &ctx)
        .await
        .unwrap();
    assert!(!result.items[0].contains_key("seen"));
    assert!(result.logs.iter().any(|l| l.contains("condition=else")));
    assert!(result.logs.iter().any(|l| l.contains("error")));
}

#[tokio::test]
async fn subflow_input_output_map_round_trip_preserves_parent_field() {
    // input_map {a: x}, child sets y := x, output_map {y: a}: parent 'a'
    // must come back unchanged
    let child = doc(json!({
        "id": "echo", "version": 1, "entry": "copy",
        "nodes": [{"id": "copy", "type": "Map", "params": {"set": {"y": "x"}}}]
    }));
    let parent = doc(json!({
        "id": "parent", "version": 1, "entry": "call",
        "nodes": [{"id": "call", "type": "Subflow", "subflow": {
            "ref": "echo@1",
            "input_map": {"a": "x"},
            "output_map": {"y": "a"}
        }}]
    }));
    let executor = executor_with(vec![child, parent]);
    let ctx = mock_ctx(StateMap::default());
    let result = executor
        .run_ref("parent@1", vec![item_of(json!({"a": 42, "other": "kept"}))], &ctx)
        .await
        .unwrap();
    assert_eq!(result.items[0]["a"], json!(42));
    assert_eq!(result.items[0]["other"], json!("kept"));
    assert!(result.logs.iter().any(|l| l.contains("Subflow[echo@1] executed")));
}

#[tokio::test]
async fn subflow_child_sees_only_mapped_fields_by_default() {
    let child = doc(json!({
        "id": "probe", "version": 1, "entry": "noop",
        "nodes": [{"id": "noop", "type": "Merge"}]
    }));
    let parent = doc(json!({
        "id": "strict", "version": 1, "entry": "call",
        "nodes": [{"id": "call", "type": "Subflow", "subflow": {
            "ref": "probe@1",
            "input_map": {"a": "mapped"}
        }}]
    }));
    let executor = executor_with(vec![child, parent]);
    let ctx = mock_ctx(StateMap::default());
    let result = executor
        .run_ref("strict@1", vec![item_of(json!({"a": 1, "hidden": 2}))], &ctx)
        .await
        .unwrap();
    // no output_map: the child's items come back as-is
    assert_eq!(result.items[0]["mapped"], json!(1));
    assert!(!result.items[0].contains_key("hidden"));
}

#[tokio::test]
async fn subflow_share_state_controls_parent_visibility() {
    let writer = doc(json!({
        "id": "writer", "version": 1, "entry": "w",
        "nodes": [{"id": "w", "type": "WriteState", "params": {"updates": {"touched": true}}}]
    }));
    let shared = doc(json!({
        "id": "shared", "version": 1, "entry": "call",
        "nodes": [{"id": "call", "type": "Subflow", "subflow": {"ref": "writer@1"}}]
    }));
    let isolated = doc(json!({
        "id": "isolated", "version": 1, "entry": "call",
        "nodes": [{"id": "call", "type": "Subflow", "subflow": {
            "ref": "writer@1", "share_state": false
        }}]
    }));
    let executor = executor_with(vec![writer, shared, isolated]);

    let ctx = mock_ctx(StateMap::default());
    executor
        .run_ref("shared@1", vec![item_of(json!({}))], &ctx)
        .await
        .unwrap();
    assert_eq!(ctx.state.read("touched"), Some(json!(true)));

    let ctx2 = mock_ctx(StateMap::default());
    executor
        .run_ref("isolated@1", vec![item_of(json!({}))], &ctx2)
        .await
        .unwrap();
    assert_eq!(ctx2.state.read("touched"), None);
}

#[tokio::test]
async fn subflow_recursion_is_capped() {
    let looper = doc(json!({
        "id": "looper", "version": 1, "entry": "again",
        "nodes": [{"id": "again", "type": "Subflow", "subflow": {"ref": "looper@1"}}]
    }));
    let executor = executor_with(vec![looper]);
    let ctx = mock_ctx(StateMap::default());
    let err = executor
        .run_ref("looper@1", vec![item_of(json!({}))], &ctx)
        .await
        .unwrap_err();
    match err {
        ExecutorError::SubflowDepth { depth, .. } => assert_eq!(depth, MAX_SUBFLOW_DEPTH + 1),
        other => panic!("expected depth error, got {other:?}"),
    }
}

#[tokio::test]
async fn sequence_composition_is_associative() {
    let make = |id: &str, nested_first: bool| {
        let grouping = if nested_first {
            json!([
                {"id": "outer", "type": "Sequence", "children": ["a", "inner"]},
                {"id": "inner", "type": "Sequence", "children": ["b", "c"]}
            ])
        } else {
            json!([
                {"id": "outer", "type": "Sequence", "children": ["inner", "c"]},
                {"id": "inner", "type": "Sequence", "children": ["a", "b"]}
            ])
        };
        let mut nodes = grouping.as_array().unwrap().clone();
        nodes.push(json!({"id": "a", "type": "Map", "params": {"set": {"a": "`1`"}}}));
        nodes.push(json!({"id": "b", "type": "Map", "params": {"set": {"b": "`2`", "a": "`10`"}}}));
        nodes.push(json!({"id": "c", "type": "Map", "params": {"set": {"c": "`3`"}}}));
        doc(json!({"id": id, "version": 1, "entry": "outer", "nodes": nodes}))
    };

    let executor = executor_with(vec![make("left", true), make("right", false)]);
    let ctx = mock_ctx(StateMap::default());
    let left = executor
        .run_ref("left@1", vec![item_of(json!({}))], &ctx)
        .await
        .unwrap();
    let right = executor
        .run_ref("right@1", vec![item_of(json!({}))], &ctx)
        .await
        .unwrap();
    assert_eq!(left.items, right.items);
    assert_eq!(left.items[0]["a"], json!(10));
    let map_logs = |logs: &[String]| {
        logs.iter()
            .filter(|l| l.starts_with("Map applied"))
            .count()
    };
    assert_eq!(map_logs(&left.logs), map_logs(&right.logs));
}

#[tokio::test]
async fn nodes_never_mutate_their_input() {
    let executor = executor_with(vec![map_chain_doc("pure", &[("added", 7)])]);
    let ctx = mock_ctx(StateMap::default());
    let input = vec![item_of(json!({"original": true}))];
    let before = input.clone();
    let result = executor.run_ref("pure@1", input.clone(), &ctx).await.unwrap();
    assert_eq!(input, before);
    assert!(result.items[0].contains_key("added"));
}

#[tokio::test]
async fn unknown_atomic_type_degrades_to_a_node_failure() {
    let d = doc(json!({
        "id": "typo", "version": 1, "entry": "bad",
        "nodes": [{"id": "bad", "type": "Bogus"}]
    }));
    let executor = executor_with(vec![d]);
    let ctx = mock_ctx(StateMap::default());
    let result = executor
        .run_ref("typo@1", vec![item_of(json!({"k": 1}))], &ctx)
        .await
        .unwrap();
    assert!(result.failed());
    assert_eq!(result.items[0]["k"], json!(1));
}

#[tokio::test]
async fn missing_flow_reference_is_not_found() {
    let executor = executor_with(vec![]);
    let ctx = mock_ctx(StateMap::default());
    let err = executor.run_ref("ghost@1", vec![], &ctx).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Flow(taleloom::ir::IrError::NotFound { .. })
    ));
}

#[tokio::test]
async fn metrics_accumulate_across_a_sequence() {
    let executor = executor_with(vec![map_chain_doc("metrics", &[("a", 1), ("b", 2)])]);
    let ctx = mock_ctx(StateMap::default());
    let result = executor
        .run_ref("metrics@1", vec![item_of(json!({}))], &ctx)
        .await
        .unwrap();
    // numeric child metrics sum (two Map runs saw one item each), while
    // the sequence stamps its own final items_out count
    assert_eq!(result.metrics["items_in"], json!(2));
    assert_eq!(result.metrics["items_out"], json!(1));
    // non-numeric collision: later value wins
    assert_eq!(result.metrics["type"], json!("Map"));
}
