//! The chat pipeline: what happens on each player send.
//!
//! `send` opens a round anchored at a fresh LSS snapshot, runs the main IR,
//! persists the reply, schedules the round's post-processing jobs in the
//! outbox, and returns immediately; the gating StatusUpdate job blocks the
//! *next* round, not this response. `reroll` recomputes a round's reply from
//! its anchor snapshot without touching round numbers or jobs. `branch`
//! forks a new line from a past round's snapshot.

use crate::engine::Engine;
use crate::executor::ExecutorError;
use crate::item::{first_string, Item};
use crate::message::{sanitize_messages, ChatMessage};
use crate::node::Metrics;
use crate::state::StateMap;
use crate::store::model::{JobKind, RoundStatus};
use crate::store::StoreError;
use crate::types::FlowRef;
use miette::Diagnostic;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Executor(#[from] ExecutorError),

    #[error("branch {branch_id} does not belong to session {session_id}")]
    #[diagnostic(code(taleloom::pipeline::branch_mismatch))]
    BranchMismatch {
        session_id: String,
        branch_id: String,
    },

    #[error("main flow run exceeded {cap_secs} s")]
    #[diagnostic(
        code(taleloom::pipeline::timeout),
        help("The round was marked failed; reroll it once the flow is fixed.")
    )]
    Timeout { cap_secs: u64 },

    #[error("job schedule misconfigured: {message}")]
    #[diagnostic(code(taleloom::pipeline::job_config))]
    JobConfig { message: String },
}

/// Parameters for one player send.
#[derive(Clone, Debug)]
pub struct SendRequest {
    pub session_id: String,
    pub branch_id: Option<String>,
    pub user_input: String,
    pub reference: String,
    pub extras: Option<Value>,
}

/// What `send` and `reroll` hand back to the surface layer.
#[derive(Clone, Debug, Serialize)]
pub struct SendOutcome {
    pub round_no: u64,
    /// Present for send; reroll keeps the original anchor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    pub llm_reply: String,
    pub items: Vec<Item>,
    pub logs: Vec<String>,
    pub metrics: Metrics,
    pub state_snapshot: StateMap,
    pub round_status: RoundStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundStatusReport {
    pub round_no: u64,
    pub status: RoundStatus,
    pub blockers: Vec<String>,
}

/// Orchestrates sends, rerolls, and branching over the engine context.
#[derive(Clone)]
pub struct ChatPipeline {
    engine: Arc<Engine>,
}

impl ChatPipeline {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Creates a session with its default branch.
    pub fn start_session(
        &self,
        initial_state: Option<StateMap>,
        use_world_state: bool,
    ) -> Result<(String, String, StateMap), PipelineError> {
        let state = initial_state.unwrap_or_else(|| {
            if use_world_state {
                self.engine.config().initial_state.clone()
            } else {
                StateMap::default()
            }
        });
        let doc = self.engine.store().create_session(state.clone())?;
        Ok((doc.id, doc.active_branch_id, state))
    }

    /// The canonical anchor: one player send.
    #[tracing::instrument(skip(self, request), fields(session = %request.session_id))]
    pub async fn send(&self, request: SendRequest) -> Result<SendOutcome, PipelineError> {
        let store = self.engine.store();
        let doc = store.load_session(&request.session_id)?;
        let branch_id = match &request.branch_id {
            Some(id) => {
                if doc.branch(id).is_none() {
                    return Err(PipelineError::BranchMismatch {
                        session_id: request.session_id.clone(),
                        branch_id: id.clone(),
                    });
                }
                id.clone()
            }
            None => doc.active_branch_id.clone(),
        };

        let state = self.engine.session_state(&request.session_id)?;
        // rejects with RoundBlocked while the previous round is gated
        let (round, snapshot) =
            store.begin_round(&request.session_id, &branch_id, &request.user_input)?;

        let ctx = self
            .engine
            .node_ctx(&request.session_id, &branch_id, round.round_no, state.clone());
        let items = vec![build_item(&request.user_input, request.extras.as_ref())];

        let result = self
            .run_capped(&request.reference, items, &ctx, &request.session_id, &branch_id, round.round_no)
            .await?;

        let llm_reply = first_string(&result.items, "llm_response")
            .or_else(|| first_string(&result.items, "narrative"))
            .unwrap_or_default();
        let messages = transcript(&result.items);

        store.save_round_result(
            &request.session_id,
            &branch_id,
            round.round_no,
            &llm_reply,
            result.items.clone(),
            result.metrics.clone(),
            result.logs.clone(),
            messages,
        )?;
        store.update_lss(&request.session_id, state.get_lss())?;

        self.schedule_round_jobs(
            &request.session_id,
            &branch_id,
            round.round_no,
            &llm_reply,
            &snapshot,
            &state,
        )?;

        let after = store.get_round(&request.session_id, &branch_id, round.round_no)?;
        Ok(SendOutcome {
            round_no: round.round_no,
            snapshot_id: Some(snapshot.id),
            llm_reply,
            items: result.items,
            logs: result.logs,
            metrics: result.metrics,
            state_snapshot: state.get_for_prompt(),
            round_status: after.status,
        })
    }

    /// Recomputes a round's reply from its anchor snapshot. Never allocates
    /// a round number and never records jobs.
    #[tracing::instrument(skip(self, extras), fields(session = %session_id, round = round_no))]
    pub async fn reroll(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        reference: &str,
        extras: Option<&Value>,
    ) -> Result<SendOutcome, PipelineError> {
        let store = self.engine.store();
        let round = store.get_round(session_id, branch_id, round_no)?;
        let snapshot = store.get_snapshot(session_id, &round.anchor_snapshot_id)?;

        // the run sees the world exactly as the round originally did
        let scratch = Arc::new(crate::state::StateManager::new(snapshot.lss_copy));
        let ctx = self
            .engine
            .node_ctx(session_id, branch_id, round_no, scratch.clone());
        let items = vec![build_item(&round.user_input, extras)];

        let result = self.engine.executor().run_ref(reference, items, &ctx).await?;

        let llm_reply = first_string(&result.items, "llm_response")
            .or_else(|| first_string(&result.items, "narrative"))
            .unwrap_or_default();
        let messages = transcript(&result.items);
        store.save_round_result(
            session_id,
            branch_id,
            round_no,
            &llm_reply,
            result.items.clone(),
            result.metrics.clone(),
            result.logs.clone(),
            messages,
        )?;

        let after = store.get_round(session_id, branch_id, round_no)?;
        Ok(SendOutcome {
            round_no,
            snapshot_id: None,
            llm_reply,
            items: result.items,
            logs: result.logs,
            metrics: result.metrics,
            state_snapshot: scratch.get_working_state(),
            round_status: after.status,
        })
    }

    /// Forks a branch from a past round; the new line starts from that
    /// round's anchor snapshot.
    pub fn branch(
        &self,
        session_id: &str,
        from_round: Option<u64>,
        parent_branch_id: Option<&str>,
        set_active: bool,
    ) -> Result<String, PipelineError> {
        let branch = self.engine.store().create_branch(
            session_id,
            parent_branch_id,
            from_round,
            set_active,
        )?;
        if from_round.is_some() {
            // the stored LSS was rewound; drop the cached manager
            self.engine.reset_session_state(session_id);
        }
        Ok(branch.id)
    }

    pub fn round_status(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
    ) -> Result<RoundStatusReport, PipelineError> {
        let round = self.engine.store().get_round(session_id, branch_id, round_no)?;
        Ok(RoundStatusReport {
            round_no: round.round_no,
            status: round.status,
            blockers: round.blockers,
        })
    }

    /// Runs the main IR under the configured wall-clock cap; past it the
    /// round fails.
    async fn run_capped(
        &self,
        reference: &str,
        items: Vec<Item>,
        ctx: &crate::node::NodeContext,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
    ) -> Result<crate::node::NodeResult, PipelineError> {
        let cap_secs = self.engine.config().main_flow_timeout_secs;
        let executor = self.engine.executor();
        let run = executor.run_ref(reference, items, ctx);
        match tokio::time::timeout(Duration::from_secs(cap_secs), run).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                self.fail_round(session_id, branch_id, round_no, &err.to_string());
                Err(err.into())
            }
            Err(_) => {
                self.fail_round(session_id, branch_id, round_no, "main flow timeout");
                Err(PipelineError::Timeout { cap_secs })
            }
        }
    }

    fn fail_round(&self, session_id: &str, branch_id: &str, round_no: u64, reason: &str) {
        if let Err(err) = self
            .engine
            .store()
            .fail_round(session_id, branch_id, round_no, reason)
        {
            tracing::warn!(error = %err, "could not mark round failed");
        }
    }

    /// Records the round's post-processing per policy: the gating
    /// StatusUpdate plus the non-blocking Guidance and Summarize jobs,
    /// marking the keys each refreshes as pending. Summarize covers the
    /// turn range captured by the round's anchor snapshot.
    fn schedule_round_jobs(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        llm_reply: &str,
        snapshot: &crate::store::model::Snapshot,
        state: &Arc<crate::state::StateManager>,
    ) -> Result<(), PipelineError> {
        let jobs = &self.engine.config().jobs;
        let store = self.engine.store();

        if jobs.status_update.enabled {
            let reference = parse_job_ref(&jobs.status_update.reference)?;
            store.record_job(
                session_id,
                branch_id,
                round_no,
                JobKind::StatusUpdate,
                true,
                reference,
                serde_json::json!({ "text": llm_reply }),
            )?;
            state.start_async_update(jobs.status_update.pending_keys.iter().cloned());
        }
        if jobs.guidance.enabled {
            let reference = parse_job_ref(&jobs.guidance.reference)?;
            store.record_job(
                session_id,
                branch_id,
                round_no,
                JobKind::Guidance,
                false,
                reference,
                serde_json::json!({ "text": llm_reply, "narrative": llm_reply }),
            )?;
            state.start_async_update(jobs.guidance.pending_keys.iter().cloned());
        }
        if jobs.summarize.enabled {
            let reference = parse_job_ref(&jobs.summarize.reference)?;
            store.record_job(
                session_id,
                branch_id,
                round_no,
                JobKind::Summarize,
                false,
                reference,
                serde_json::json!({
                    "text": llm_reply,
                    "range_start": snapshot.range[0],
                    "range_end": snapshot.range[1],
                }),
            )?;
            state.start_async_update(jobs.summarize.pending_keys.iter().cloned());
        }
        Ok(())
    }
}

fn build_item(user_input: &str, extras: Option<&Value>) -> Item {
    let mut item = crate::item::item_with("user_input", Value::String(user_input.to_string()));
    if let Some(Value::Object(map)) = extras {
        for (key, value) in map {
            item.insert(key.clone(), value.clone());
        }
    }
    item
}

fn transcript(items: &[Item]) -> Vec<ChatMessage> {
    items
        .first()
        .and_then(|item| item.get("messages"))
        .map(sanitize_messages)
        .unwrap_or_default()
}

fn parse_job_ref(reference: &str) -> Result<FlowRef, PipelineError> {
    reference
        .parse()
        .map_err(|err: crate::types::FlowRefError| PipelineError::JobConfig {
            message: err.to_string(),
        })
}
