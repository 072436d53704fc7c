//! The job worker: executes gating and non-blocking subflow jobs.
//!
//! A handler loads the job and its session, runs the referenced subflow on
//! a scratch state manager seeded from the session LSS, and writes back the
//! keys the run changed. Completion also commits those keys on the session's
//! live state manager, clearing their pending marks so the next prompt sees
//! the refreshed values.
//!
//! Delivery is at-least-once: a completed job short-circuits on redelivery,
//! and failures retry with exponential backoff before the job (and, for a
//! blocking job, its round) is marked failed.

use crate::config::StaleJobPolicy;
use crate::engine::Engine;
use crate::executor::ExecutorError;
use crate::item::Item;
use crate::state::StateMap;
use crate::store::model::{Job, JobKind, JobStatus, SessionDoc};
use crate::store::StoreError;
use miette::Diagnostic;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Executor(#[from] ExecutorError),

    #[error("job handler failed: {message}")]
    #[diagnostic(code(taleloom::jobs::handler))]
    Handler { message: String },
}

/// Executes jobs against the engine context.
#[derive(Clone)]
pub struct JobWorker {
    engine: Arc<Engine>,
}

impl JobWorker {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Runs a job to completion with the configured retry schedule. On
    /// exhaustion the job is marked failed with its last error.
    #[tracing::instrument(skip(self), fields(session = %session_id, job = %job_id))]
    pub async fn run_job(&self, session_id: &str, job_id: &str) -> Result<(), WorkerError> {
        let policy = self.engine.config().worker;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(session_id, job_id).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < policy.max_attempts => {
                    let backoff = Duration::from_millis(
                        (policy.backoff_base_ms as f64
                            * policy.backoff_factor.powi(attempt as i32 - 1))
                            as u64,
                    );
                    tracing::warn!(
                        error = %err,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "job attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, attempt, "job failed permanently");
                    self.engine.store().update_job_status(
                        session_id,
                        job_id,
                        JobStatus::Failed,
                        Some(err.to_string()),
                        None,
                    )?;
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(&self, session_id: &str, job_id: &str) -> Result<(), WorkerError> {
        let store = self.engine.store();
        let doc = store.load_session(session_id)?;
        let Some(job) = doc.job(job_id).cloned() else {
            return Err(WorkerError::Store(StoreError::NotFound {
                what: "job",
                id: job_id.to_string(),
            }));
        };
        // idempotent under at-least-once redelivery
        if job.status == JobStatus::Completed {
            return Ok(());
        }

        store.update_job_status(session_id, job_id, JobStatus::Running, None, None)?;

        let scratch = Arc::new(crate::state::StateManager::new(doc.lss.clone()));
        let ctx = self
            .engine
            .node_ctx(session_id, &job.branch_id, job.round_no, scratch.clone());
        let input = payload_item(&job);

        let result = self
            .engine
            .executor()
            .run_ref(&job.reference.to_string(), vec![input], &ctx)
            .await?;
        if result.failed() {
            return Err(WorkerError::Handler {
                message: result.errors.join("; "),
            });
        }

        let updates = diff_state(&doc.lss, &scratch.get_working_state());
        let pending_keys = self.pending_keys_for(job.kind);

        // a reroll or branch may have moved the line on while this ran
        let current = store.load_session(session_id)?;
        let stale = !job.blocking && is_stale(&current, &job);
        let discard =
            stale && self.engine.config().stale_job_outputs == StaleJobPolicy::Discard;
        if stale {
            tracing::info!(
                kind = %job.kind,
                round = job.round_no,
                discard,
                "non-blocking job output is stale"
            );
        }

        if let Ok(live) = self.engine.session_state(session_id) {
            if discard {
                live.cancel_async_update(&pending_keys);
            } else {
                live.complete_async_update(updates.clone());
                // a declared key the run never produced must not stay pending
                live.cancel_async_update(&pending_keys);
            }
        }

        store.update_job_status(
            session_id,
            job_id,
            JobStatus::Completed,
            None,
            if discard { None } else { Some(updates) },
        )?;
        tracing::info!(kind = %job.kind, round = job.round_no, "job completed");
        Ok(())
    }

    fn pending_keys_for(&self, kind: JobKind) -> Vec<String> {
        let jobs = &self.engine.config().jobs;
        match kind {
            JobKind::StatusUpdate => jobs.status_update.pending_keys.clone(),
            JobKind::Guidance => jobs.guidance.pending_keys.clone(),
            JobKind::Summarize => jobs.summarize.pending_keys.clone(),
        }
    }
}

/// The job's input payload as a single item.
fn payload_item(job: &Job) -> Item {
    serde_json::from_value(job.input_payload.clone()).unwrap_or_else(|_| {
        crate::item::item_with("payload", job.input_payload.clone())
    })
}

/// Keys whose values changed between the seed LSS and the working state
/// after the run.
fn diff_state(before: &StateMap, after: &StateMap) -> StateMap {
    after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// A non-blocking job is stale when its anchor round is no longer the
/// newest round of the session's active branch.
fn is_stale(doc: &SessionDoc, job: &Job) -> bool {
    if doc.active_branch_id != job.branch_id {
        return true;
    }
    match doc.latest_round(&doc.active_branch_id) {
        Some(latest) => latest.round_no != job.round_no,
        None => true,
    }
}
