mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use taleloom::config::StaleJobPolicy;
use taleloom::engine::Engine;
use taleloom::jobs::{JobWorker, OutboxPoller};
use taleloom::pipeline::{ChatPipeline, PipelineError, SendRequest};
use taleloom::store::model::{JobKind, JobStatus, RoundStatus};
use taleloom::store::StoreError;

fn send_req(session_id: &str, input: &str) -> SendRequest {
    SendRequest {
        session_id: session_id.to_string(),
        branch_id: None,
        user_input: input.to_string(),
        reference: "main@1".to_string(),
        extras: None,
    }
}

#[tokio::test]
async fn session_start_and_first_send() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let pipeline = ChatPipeline::new(engine.clone());

    let (session_id, branch_id, state) = pipeline.start_session(None, true).unwrap();
    assert!(session_id.starts_with("sess_"));
    assert!(branch_id.starts_with("br_"));
    assert_eq!(state["turn_count"], json!(0));

    let outcome = pipeline.send(send_req(&session_id, "enter tavern")).await.unwrap();
    assert_eq!(outcome.round_no, 1);
    assert!(outcome.snapshot_id.is_some());
    assert!(!outcome.llm_reply.is_empty());
    assert_eq!(outcome.state_snapshot["turn_count"], json!(1));
    assert_eq!(outcome.round_status, RoundStatus::Blocked);
    // the reply is durably on the round
    let round = engine.store().get_round(&session_id, &branch_id, 1).unwrap();
    assert_eq!(round.llm_reply.as_deref(), Some(outcome.llm_reply.as_str()));
    assert!(!round.messages.is_empty());
}

#[tokio::test]
async fn gating_blocks_the_next_send_until_the_job_completes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let pipeline = ChatPipeline::new(engine.clone());
    let poller = OutboxPoller::new(engine.clone());

    let (session_id, branch_id, _) = pipeline.start_session(None, true).unwrap();
    pipeline.send(send_req(&session_id, "enter tavern")).await.unwrap();

    let err = pipeline.send(send_req(&session_id, "again")).await.unwrap_err();
    match err {
        PipelineError::Store(StoreError::RoundBlocked { round_no, blockers }) => {
            assert_eq!(round_no, 1);
            assert!(!blockers.is_empty());
        }
        other => panic!("expected RoundBlocked, got {other:?}"),
    }

    // the inline queue drains the outbox and runs both jobs
    let dispatched = poller.poll_once().await;
    assert!(dispatched >= 1);

    let status = pipeline.round_status(&session_id, &branch_id, 1).unwrap();
    assert_eq!(status.status, RoundStatus::Completed);
    assert!(status.blockers.is_empty());

    let outcome = pipeline.send(send_req(&session_id, "go deeper")).await.unwrap();
    assert_eq!(outcome.round_no, 2);
}

#[tokio::test]
async fn gating_job_refreshes_state_through_the_pending_mechanism() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let pipeline = ChatPipeline::new(engine.clone());
    let poller = OutboxPoller::new(engine.clone());

    let (session_id, _, _) = pipeline.start_session(None, true).unwrap();
    pipeline.send(send_req(&session_id, "rest by the fire")).await.unwrap();

    // every declared refresh key is pending until the jobs land
    let state = engine.session_state(&session_id).unwrap();
    let pending = state.pending_keys();
    assert!(pending.contains(&"protagonist_mood".to_string()));
    assert!(pending.contains(&"guidance".to_string()));
    assert!(pending.contains(&"story_summary".to_string()));
    // prompt reads fall back to the stable value meanwhile
    assert_eq!(state.get_for_prompt()["protagonist_mood"], json!("neutral"));

    // the summarize job covers the anchor snapshot's turn range
    let doc = engine.store().load_session(&session_id).unwrap();
    let summarize = doc
        .jobs
        .iter()
        .find(|j| j.kind == JobKind::Summarize)
        .unwrap();
    assert!(!summarize.blocking);
    assert_eq!(summarize.input_payload["range_start"], json!(0));
    assert_eq!(summarize.input_payload["range_end"], json!(0));

    poller.poll_once().await;

    let state = engine.session_state(&session_id).unwrap();
    assert!(state.pending_keys().is_empty());
    let mood = state.get_for_prompt()["protagonist_mood"].clone();
    assert_ne!(mood, json!("neutral"));
    // and the refreshes are durable
    let doc = engine.store().load_session(&session_id).unwrap();
    assert_eq!(doc.lss["protagonist_mood"], mood);
    assert!(doc.lss.contains_key("guidance"));
    assert!(doc.lss.contains_key("story_summary"));
}

#[tokio::test]
async fn reroll_keeps_round_number_jobs_and_turn_count() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let pipeline = ChatPipeline::new(engine.clone());

    let (session_id, branch_id, _) = pipeline.start_session(None, true).unwrap();
    pipeline.send(send_req(&session_id, "enter tavern")).await.unwrap();
    let jobs_before = engine.store().load_session(&session_id).unwrap().jobs.len();

    let outcome = pipeline
        .reroll(&session_id, &branch_id, 1, "main@1", None)
        .await
        .unwrap();
    assert_eq!(outcome.round_no, 1);
    assert!(outcome.snapshot_id.is_none());
    assert!(!outcome.llm_reply.is_empty());

    let doc = engine.store().load_session(&session_id).unwrap();
    assert_eq!(doc.jobs.len(), jobs_before);
    assert_eq!(doc.lss["turn_count"], json!(1));
    assert_eq!(doc.rounds.len(), 1);
    // reroll re-ran the flow against the anchor snapshot (turn 0 -> 1)
    assert_eq!(outcome.state_snapshot["turn_count"], json!(1));
}

#[tokio::test]
async fn branch_from_round_starts_from_that_rounds_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let pipeline = ChatPipeline::new(engine.clone());
    let poller = OutboxPoller::new(engine.clone());

    let (session_id, original_branch, _) = pipeline.start_session(None, true).unwrap();
    pipeline.send(send_req(&session_id, "one")).await.unwrap();
    poller.poll_once().await;
    pipeline.send(send_req(&session_id, "two")).await.unwrap();
    poller.poll_once().await;

    let fork_id = pipeline.branch(&session_id, Some(1), None, true).unwrap();
    assert_ne!(fork_id, original_branch);

    // the new line starts from round 1's anchor, not round 2's outcome
    let doc = engine.store().load_session(&session_id).unwrap();
    assert_eq!(doc.active_branch_id, fork_id);
    assert_eq!(doc.lss["turn_count"], json!(0));

    let outcome = pipeline.send(send_req(&session_id, "fork path")).await.unwrap();
    assert_eq!(outcome.round_no, 2);
    assert_eq!(outcome.state_snapshot["turn_count"], json!(1));
}

#[tokio::test]
async fn sends_target_the_active_branch_and_validate_explicit_ones() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let pipeline = ChatPipeline::new(engine.clone());

    let (session_id, _, _) = pipeline.start_session(None, true).unwrap();
    let mut req = send_req(&session_id, "go");
    req.branch_id = Some("br_ghost".to_string());
    let err = pipeline.send(req).await.unwrap_err();
    assert!(matches!(err, PipelineError::BranchMismatch { .. }));
}

#[tokio::test]
async fn stale_guidance_output_is_discarded_under_the_discard_policy() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.stale_job_outputs = StaleJobPolicy::Discard;
    let engine = Arc::new(Engine::new(config).unwrap());
    let pipeline = ChatPipeline::new(engine.clone());
    let worker = JobWorker::new(engine.clone());

    let (session_id, _, _) = pipeline.start_session(None, true).unwrap();
    pipeline.send(send_req(&session_id, "one")).await.unwrap();

    // complete only the gating job so round 2 can open while the guidance
    // job is still waiting
    let doc = engine.store().load_session(&session_id).unwrap();
    let gating = doc
        .jobs
        .iter()
        .find(|j| j.kind == JobKind::StatusUpdate)
        .unwrap()
        .clone();
    worker.run_job(&session_id, &gating.id).await.unwrap();
    pipeline.send(send_req(&session_id, "two")).await.unwrap();

    // the guidance job's anchor (round 1) is no longer the newest round
    let doc = engine.store().load_session(&session_id).unwrap();
    let guidance = doc
        .jobs
        .iter()
        .find(|j| j.kind == JobKind::Guidance)
        .unwrap()
        .clone();
    worker.run_job(&session_id, &guidance.id).await.unwrap();

    let doc = engine.store().load_session(&session_id).unwrap();
    assert_eq!(doc.job(&guidance.id).unwrap().status, JobStatus::Completed);
    assert!(!doc.lss.contains_key("guidance"));
    // pending marks are cleared even though the output was dropped
    let state = engine.session_state(&session_id).unwrap();
    assert!(!state.pending_keys().contains(&"guidance".to_string()));
}

#[tokio::test]
async fn completed_jobs_are_safe_to_redeliver() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let pipeline = ChatPipeline::new(engine.clone());
    let worker = JobWorker::new(engine.clone());

    let (session_id, _, _) = pipeline.start_session(None, true).unwrap();
    pipeline.send(send_req(&session_id, "go")).await.unwrap();

    let doc = engine.store().load_session(&session_id).unwrap();
    let gating = doc
        .jobs
        .iter()
        .find(|j| j.kind == JobKind::StatusUpdate)
        .unwrap()
        .clone();
    worker.run_job(&session_id, &gating.id).await.unwrap();
    let after_first = engine.store().load_session(&session_id).unwrap();
    let attempts = after_first.job(&gating.id).unwrap().attempts;

    // duplicate delivery short-circuits without another attempt
    worker.run_job(&session_id, &gating.id).await.unwrap();
    let after_second = engine.store().load_session(&session_id).unwrap();
    assert_eq!(after_second.job(&gating.id).unwrap().attempts, attempts);
    assert_eq!(
        after_second.job(&gating.id).unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn failing_job_exhausts_retries_and_fails_the_round() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // point the gating job at a flow that does not exist
    config.jobs.status_update.reference = "ghost@1".to_string();
    config.jobs.guidance.enabled = false;
    config.jobs.summarize.enabled = false;
    config.worker.max_attempts = 2;
    let engine = Arc::new(Engine::new(config).unwrap());
    let pipeline = ChatPipeline::new(engine.clone());
    let poller = OutboxPoller::new(engine.clone());

    let (session_id, branch_id, _) = pipeline.start_session(None, true).unwrap();
    pipeline.send(send_req(&session_id, "go")).await.unwrap();
    poller.poll_once().await;

    let doc = engine.store().load_session(&session_id).unwrap();
    let job = &doc.jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.last_error.is_some());
    let status = pipeline.round_status(&session_id, &branch_id, 1).unwrap();
    assert_eq!(status.status, RoundStatus::Failed);
}
