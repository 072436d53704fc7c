mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use serde_json::{json, Value};
use std::sync::Arc;
use taleloom::engine::Engine;
use taleloom::jobs::OutboxPoller;
use taleloom::server;
use tower::ServiceExt;

fn app(engine: Arc<Engine>) -> Router {
    server::router(engine)
}

async fn call(router: &Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn session_start_send_and_round_gating_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let poller = OutboxPoller::new(engine.clone());
    let router = app(engine);

    let (status, started) = call(
        &router,
        "POST",
        "/api/chat/session/start",
        Some(json!({"use_world_state": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = started["session_id"].as_str().unwrap().to_string();
    let branch_id = started["branch_id"].as_str().unwrap().to_string();
    assert_eq!(started["state_snapshot"]["turn_count"], json!(0));

    let (status, sent) = call(
        &router,
        "POST",
        "/api/chat/send",
        Some(json!({
            "session_id": session_id,
            "user_input": "enter tavern",
            "ref": "main@1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["round_no"], json!(1));
    assert!(sent["llm_reply"].as_str().unwrap().len() > 0);
    assert!(sent["snapshot_id"].is_string());
    assert_eq!(sent["state_snapshot"]["turn_count"], json!(1));
    assert_eq!(sent["round_status"], json!("blocked"));

    // round 1 is gated: the next send conflicts
    let (status, blocked) = call(
        &router,
        "POST",
        "/api/chat/send",
        Some(json!({
            "session_id": session_id,
            "user_input": "again",
            "ref": "main@1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(blocked["detail"]["error"], json!("round_blocked"));
    assert_eq!(blocked["detail"]["round_no"], json!(1));
    assert!(!blocked["detail"]["blockers"].as_array().unwrap().is_empty());

    poller.poll_once().await;

    let (status, round) = call(
        &router,
        "GET",
        &format!("/api/chat/round/{session_id}/{branch_id}/1/status"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(round["status"], json!("completed"));
    assert_eq!(round["blockers"], json!([]));

    let (status, second) = call(
        &router,
        "POST",
        "/api/chat/send",
        Some(json!({
            "session_id": session_id,
            "user_input": "next",
            "ref": "main@1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["round_no"], json!(2));
}

#[tokio::test]
async fn reroll_and_branch_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let poller = OutboxPoller::new(engine.clone());
    let router = app(engine.clone());

    let (_, started) = call(
        &router,
        "POST",
        "/api/chat/session/start",
        Some(json!({})),
    )
    .await;
    let session_id = started["session_id"].as_str().unwrap().to_string();
    let branch_id = started["branch_id"].as_str().unwrap().to_string();
    call(
        &router,
        "POST",
        "/api/chat/send",
        Some(json!({"session_id": session_id, "user_input": "one", "ref": "main@1"})),
    )
    .await;

    let (status, rerolled) = call(
        &router,
        "POST",
        "/api/chat/round/reroll",
        Some(json!({
            "session_id": session_id,
            "branch_id": branch_id,
            "round_no": 1,
            "ref": "main@1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rerolled["round_no"], json!(1));
    assert!(rerolled.get("snapshot_id").is_none());
    let jobs = engine.store().load_session(&session_id).unwrap().jobs.len();
    assert_eq!(jobs, 3);

    poller.poll_once().await;
    let (status, branched) = call(
        &router,
        "POST",
        "/api/chat/branch",
        Some(json!({"session_id": session_id, "from_round": 1, "set_active": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(branched["branch_id"].as_str().unwrap().starts_with("br_"));
}

#[tokio::test]
async fn flow_run_validate_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let router = app(engine);

    let (status, run) = call(
        &router,
        "POST",
        "/api/flow/run",
        Some(json!({
            "ref": "main@1",
            "items": [{"user_input": "look"}],
            "use_world_state": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(run["items"][0]["llm_response"].as_str().unwrap().len() > 0);
    assert_eq!(run["state_snapshot"]["turn_count"], json!(1));
    assert!(run["logs"].as_array().unwrap().len() > 0);

    let (status, missing) = call(
        &router,
        "POST",
        "/api/flow/run",
        Some(json!({"ref": "ghost@9", "items": []})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(missing["detail"].as_str().unwrap().contains("ghost@9"));

    let (status, verdict) = call(
        &router,
        "POST",
        "/api/flow/validate",
        Some(json!({"doc": {"id": "x", "version": 1, "entry": "nope", "nodes": []}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["valid"], json!(false));
    assert_eq!(verdict["error"], json!("entry not found"));

    let (status, ok) = call(
        &router,
        "POST",
        "/api/flow/validate",
        Some(json!({"doc": {
            "id": "x", "version": 1, "entry": "m",
            "nodes": [{"id": "m", "type": "Merge"}]
        }})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ok["valid"], json!(true));

    let (status, reloaded) = call(&router, "POST", "/api/flow/reload", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let flows: Vec<&str> = reloaded["flows"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(flows.contains(&"main@1"));
    assert!(flows.contains(&"postprocess@1"));
    let node_types: Vec<&str> = reloaded["node_types"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    for expected in [
        "Sequence",
        "If",
        "Subflow",
        "Code",
        "LLMChat",
        "ReadState",
        "WriteState",
        "IncrementCounter",
        "Map",
        "Filter",
        "Merge",
        "Split",
    ] {
        assert!(node_types.contains(&expected), "missing {expected}");
    }
}

#[tokio::test]
async fn debug_traffic_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    // seed an event directly; the mock adapter never performs HTTP
    engine
        .traffic()
        .log_request("POST", "https://api.example?key=abc", &json!({}), &json!({}));
    let router = app(engine);

    let (status, events) = call(&router, "GET", "/api/debug/traffic?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    let events = events.as_array().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(events[0]["url"].as_str().unwrap().contains("key=***"));

    let (status, cleared) = call(&router, "POST", "/api/debug/traffic/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["cleared"], json!(true));
    let (_, events) = call(&router, "GET", "/api/debug/traffic", None).await;
    assert_eq!(events.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn missing_session_maps_to_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let router = app(engine);
    let (status, body) = call(
        &router,
        "POST",
        "/api/chat/send",
        Some(json!({"session_id": "sess_ghost", "user_input": "x", "ref": "main@1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].as_str().unwrap().contains("sess_ghost"));
}
