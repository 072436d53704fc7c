//! Durable session store: one directory per session, one canonical JSON
//! document holding the full session tree.
//!
//! Consistency model:
//! - every write is an atomic replace (temp file, fsync, rename)
//! - a per-session lock serializes read-modify-write cycles in this process
//! - the directory is owned by a single process; cross-process locking is
//!   explicitly out of scope
//!
//! Jobs follow the outbox pattern: [`SessionStore::record_job`] inserts the
//! job and its outbox entry in the same write, the poller later claims
//! pending entries. Idempotency keys make duplicate insertion and duplicate
//! delivery both safe.

pub mod model;

use crate::state::StateMap;
use crate::types::{self, FlowRef};
use chrono::Utc;
use miette::Diagnostic;
use model::{
    Branch, Job, JobKind, JobStatus, OutboxEntry, Round, RoundStatus, SessionDoc, Snapshot,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("{what} not found: {id}")]
    #[diagnostic(code(taleloom::store::not_found))]
    NotFound { what: &'static str, id: String },

    #[error("round {round_no} is blocked by {blockers:?}")]
    #[diagnostic(
        code(taleloom::store::round_blocked),
        help("Wait for the round's gating jobs to complete before sending again.")
    )]
    RoundBlocked {
        round_no: u64,
        blockers: Vec<String>,
    },

    #[error("store I/O failed at {path}: {source}")]
    #[diagnostic(code(taleloom::store::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session document at {path} is corrupt: {message}")]
    #[diagnostic(code(taleloom::store::corrupt))]
    Corrupt { path: PathBuf, message: String },
}

/// Behavior toggles the store consults when jobs finish.
#[derive(Clone, Copy, Debug)]
pub struct StorePolicy {
    /// Fail the owning round when a blocking job fails. When false the
    /// round stays blocked awaiting a retry.
    pub fail_round_on_blocker_failure: bool,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            fail_round_on_blocker_failure: true,
        }
    }
}

/// File-backed store for the session tree.
pub struct SessionStore {
    base_dir: PathBuf,
    policy: StorePolicy,
    locks: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>, policy: StorePolicy) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|source| StoreError::Io {
            path: base_dir.clone(),
            source,
        })?;
        Ok(Self {
            base_dir,
            policy,
            locks: Mutex::new(FxHashMap::default()),
        })
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id).join("session.json")
    }

    fn read_doc(&self, session_id: &str) -> Result<SessionDoc, StoreError> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Err(StoreError::NotFound {
                what: "session",
                id: session_id.to_string(),
            });
        }
        let text = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
            path,
            message: e.to_string(),
        })
    }

    fn write_doc(&self, doc: &SessionDoc) -> Result<(), StoreError> {
        let path = self.session_path(&doc.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(doc).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let io_err = |source| StoreError::Io {
            path: tmp.clone(),
            source,
        };
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(text.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }

    /// Loads, mutates, and atomically rewrites one session document.
    fn with_doc<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionDoc) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();
        let mut doc = self.read_doc(session_id)?;
        let out = f(&mut doc)?;
        self.write_doc(&doc)?;
        Ok(out)
    }

    // ------------- sessions and branches -------------

    /// Creates a session with its default branch.
    pub fn create_session(&self, initial_state: StateMap) -> Result<SessionDoc, StoreError> {
        let now = Utc::now();
        let mut doc = SessionDoc {
            id: types::new_session_id(),
            created_at: now,
            active_branch_id: String::new(),
            branches: vec![],
            rounds: vec![],
            snapshots: vec![],
            jobs: vec![],
            outbox: vec![],
            lss: initial_state,
        };
        let branch = Branch {
            id: types::new_branch_id(),
            parent_branch_id: None,
            parent_round_no: None,
            created_at: now,
        };
        doc.active_branch_id = branch.id.clone();
        doc.branches.push(branch);
        let lock = self.session_lock(&doc.id);
        let _guard = lock.lock();
        self.write_doc(&doc)?;
        tracing::info!(session = %doc.id, branch = %doc.active_branch_id, "session created");
        Ok(doc)
    }

    pub fn load_session(&self, session_id: &str) -> Result<SessionDoc, StoreError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();
        self.read_doc(session_id)
    }

    /// Session ids present on disk, sorted.
    pub fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let entries = std::fs::read_dir(&self.base_dir).map_err(|source| StoreError::Io {
            path: self.base_dir.clone(),
            source,
        })?;
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join("session.json").exists())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Creates a branch, optionally forking from a parent round. When the
    /// fork round is given, the session LSS is reset to that round's anchor
    /// snapshot so the new line starts from the snapshotted state.
    pub fn create_branch(
        &self,
        session_id: &str,
        parent_branch_id: Option<&str>,
        from_round: Option<u64>,
        set_active: bool,
    ) -> Result<Branch, StoreError> {
        self.with_doc(session_id, |doc| {
            let parent_id = match parent_branch_id {
                Some(id) => {
                    if doc.branch(id).is_none() {
                        return Err(StoreError::NotFound {
                            what: "branch",
                            id: id.to_string(),
                        });
                    }
                    id.to_string()
                }
                None => doc.active_branch_id.clone(),
            };

            if let Some(round_no) = from_round {
                let round = doc.round(&parent_id, round_no).ok_or(StoreError::NotFound {
                    what: "round",
                    id: format!("{parent_id}:{round_no}"),
                })?;
                let snapshot =
                    doc.snapshot(&round.anchor_snapshot_id)
                        .ok_or(StoreError::NotFound {
                            what: "snapshot",
                            id: round.anchor_snapshot_id.clone(),
                        })?;
                doc.lss = snapshot.lss_copy.clone();
            }

            let branch = Branch {
                id: types::new_branch_id(),
                parent_branch_id: Some(parent_id),
                parent_round_no: from_round,
                created_at: Utc::now(),
            };
            doc.branches.push(branch.clone());
            if set_active {
                doc.active_branch_id = branch.id.clone();
            }
            Ok(branch)
        })
    }

    pub fn set_active_branch(&self, session_id: &str, branch_id: &str) -> Result<(), StoreError> {
        self.with_doc(session_id, |doc| {
            if doc.branch(branch_id).is_none() {
                return Err(StoreError::NotFound {
                    what: "branch",
                    id: branch_id.to_string(),
                });
            }
            doc.active_branch_id = branch_id.to_string();
            Ok(())
        })
    }

    // ------------- rounds and snapshots -------------

    /// Opens a round anchored at a fresh snapshot of the current LSS.
    ///
    /// Rejected while the branch's newest round is still blocked; gating
    /// jobs must finish before the next round is admitted.
    pub fn begin_round(
        &self,
        session_id: &str,
        branch_id: &str,
        user_input: &str,
    ) -> Result<(Round, Snapshot), StoreError> {
        self.with_doc(session_id, |doc| {
            if doc.branch(branch_id).is_none() {
                return Err(StoreError::NotFound {
                    what: "branch",
                    id: branch_id.to_string(),
                });
            }
            if let Some(latest) = doc.latest_round(branch_id) {
                if latest.status == RoundStatus::Blocked {
                    return Err(StoreError::RoundBlocked {
                        round_no: latest.round_no,
                        blockers: latest.blockers.clone(),
                    });
                }
            }

            let round_no = doc.next_round_no(branch_id);
            let turn_count = doc
                .lss
                .get("turn_count")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let now = Utc::now();
            let snapshot = Snapshot {
                id: types::new_snapshot_id(),
                branch_id: branch_id.to_string(),
                taken_at_round_no: round_no,
                lss_copy: doc.lss.clone(),
                range: [0, turn_count],
                created_at: now,
            };
            let round = Round {
                branch_id: branch_id.to_string(),
                round_no,
                status: RoundStatus::Open,
                blockers: vec![],
                anchor_snapshot_id: snapshot.id.clone(),
                user_input: user_input.to_string(),
                llm_reply: None,
                items: None,
                metrics: None,
                logs: vec![],
                messages: vec![],
                created_at: now,
            };
            doc.snapshots.push(snapshot.clone());
            doc.rounds.push(round.clone());
            Ok((round, snapshot))
        })
    }

    /// Persists the round's reply and run artifacts. Used by both send and
    /// reroll; reroll replaces the previous values in place.
    #[allow(clippy::too_many_arguments)]
    pub fn save_round_result(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        llm_reply: &str,
        items: Vec<crate::item::Item>,
        metrics: crate::node::Metrics,
        logs: Vec<String>,
        messages: Vec<crate::message::ChatMessage>,
    ) -> Result<(), StoreError> {
        self.with_doc(session_id, |doc| {
            let round = doc
                .round_mut(branch_id, round_no)
                .ok_or(StoreError::NotFound {
                    what: "round",
                    id: format!("{branch_id}:{round_no}"),
                })?;
            round.llm_reply = Some(llm_reply.to_string());
            round.items = Some(items);
            round.metrics = Some(metrics);
            round.logs = logs;
            round.messages = messages;
            Ok(())
        })
    }

    /// Marks a round failed, clearing its blockers. Used when the main IR
    /// run errors or exceeds its wall-clock cap.
    pub fn fail_round(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.with_doc(session_id, |doc| {
            let round = doc
                .round_mut(branch_id, round_no)
                .ok_or(StoreError::NotFound {
                    what: "round",
                    id: format!("{branch_id}:{round_no}"),
                })?;
            round.status = RoundStatus::Failed;
            round.blockers.clear();
            round.logs.push(format!("round failed: {reason}"));
            Ok(())
        })
    }

    pub fn get_round(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
    ) -> Result<Round, StoreError> {
        let doc = self.load_session(session_id)?;
        doc.round(branch_id, round_no)
            .cloned()
            .ok_or(StoreError::NotFound {
                what: "round",
                id: format!("{branch_id}:{round_no}"),
            })
    }

    pub fn get_snapshot(&self, session_id: &str, snapshot_id: &str) -> Result<Snapshot, StoreError> {
        let doc = self.load_session(session_id)?;
        doc.snapshot(snapshot_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                what: "snapshot",
                id: snapshot_id.to_string(),
            })
    }

    /// Writes refreshed state into the session LSS.
    pub fn update_lss(&self, session_id: &str, updates: StateMap) -> Result<(), StoreError> {
        self.with_doc(session_id, |doc| {
            doc.lss.extend(updates);
            Ok(())
        })
    }

    // ------------- jobs and outbox -------------

    /// Deterministic dedup key over the job's identity tuple.
    #[must_use]
    pub fn idempotency_key(
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        kind: JobKind,
        reference: &FlowRef,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            format!("{session_id}|{branch_id}|{round_no}|{kind}|{reference}").as_bytes(),
        );
        format!("{:x}", hasher.finalize())
    }

    /// Records a job and its outbox entry. A second insertion with the same
    /// identity tuple returns the existing job unchanged. Blocking jobs are
    /// added to the owning round's blockers and mark it blocked.
    pub fn record_job(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        kind: JobKind,
        blocking: bool,
        reference: FlowRef,
        input_payload: Value,
    ) -> Result<Job, StoreError> {
        self.with_doc(session_id, |doc| {
            let key = Self::idempotency_key(&doc.id, branch_id, round_no, kind, &reference);
            if let Some(existing) = doc.jobs.iter().find(|j| j.idempotency_key == key) {
                return Ok(existing.clone());
            }
            if doc.round(branch_id, round_no).is_none() {
                return Err(StoreError::NotFound {
                    what: "round",
                    id: format!("{branch_id}:{round_no}"),
                });
            }

            let now = Utc::now();
            let job = Job {
                id: types::new_job_id(),
                kind,
                blocking,
                session_id: doc.id.clone(),
                branch_id: branch_id.to_string(),
                round_no,
                reference,
                input_payload,
                idempotency_key: key,
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            doc.outbox.push(OutboxEntry {
                job_id: job.id.clone(),
                enqueued_at: None,
                delivered: false,
            });
            if blocking {
                if let Some(round) = doc.round_mut(branch_id, round_no) {
                    round.blockers.push(job.id.clone());
                    round.blockers.sort();
                    round.blockers.dedup();
                    round.status = RoundStatus::Blocked;
                }
            }
            doc.jobs.push(job.clone());
            Ok(job)
        })
    }

    /// Marks a job delivered to the queue: outbox entry delivered, job
    /// status enqueued. Claim and status change happen in one write.
    pub fn mark_job_enqueued(&self, session_id: &str, job_id: &str) -> Result<(), StoreError> {
        self.with_doc(session_id, |doc| {
            let now = Utc::now();
            if let Some(entry) = doc.outbox_mut(job_id) {
                entry.delivered = true;
                entry.enqueued_at = Some(now);
            }
            let job = doc.job_mut(job_id).ok_or(StoreError::NotFound {
                what: "job",
                id: job_id.to_string(),
            })?;
            job.status = JobStatus::Enqueued;
            job.updated_at = now;
            Ok(())
        })
    }

    /// Updates a job's status, applying any state refresh to the session
    /// LSS and maintaining the owning round's blockers.
    ///
    /// On `Completed` for a blocking job the id leaves the round's blocker
    /// set, completing the round when the set empties. On `Failed`, the
    /// round fails only under `fail_round_on_blocker_failure`; otherwise it
    /// stays blocked awaiting redelivery. `Running` counts one attempt.
    pub fn update_job_status(
        &self,
        session_id: &str,
        job_id: &str,
        status: JobStatus,
        last_error: Option<String>,
        state_updates: Option<StateMap>,
    ) -> Result<Job, StoreError> {
        let policy = self.policy;
        self.with_doc(session_id, |doc| {
            let job = doc.job_mut(job_id).ok_or(StoreError::NotFound {
                what: "job",
                id: job_id.to_string(),
            })?;
            job.status = status;
            job.updated_at = Utc::now();
            if status == JobStatus::Running {
                job.attempts += 1;
            }
            if let Some(err) = last_error {
                job.last_error = Some(err);
            }
            let (blocking, branch_id, round_no) =
                (job.blocking, job.branch_id.clone(), job.round_no);

            if let Some(updates) = state_updates {
                doc.lss.extend(updates);
            }

            match status {
                JobStatus::Completed if blocking => {
                    if let Some(round) = doc.round_mut(&branch_id, round_no) {
                        round.blockers.retain(|id| id != job_id);
                        if round.blockers.is_empty() && round.status == RoundStatus::Blocked {
                            round.status = RoundStatus::Completed;
                        }
                    }
                }
                JobStatus::Failed if blocking && policy.fail_round_on_blocker_failure => {
                    if let Some(round) = doc.round_mut(&branch_id, round_no) {
                        round.blockers.retain(|id| id != job_id);
                        round.status = RoundStatus::Failed;
                    }
                }
                _ => {}
            }
            doc.job(job_id).cloned().ok_or(StoreError::NotFound {
                what: "job",
                id: job_id.to_string(),
            })
        })
    }

    /// Undelivered pending jobs for one session, oldest first.
    pub fn list_pending_jobs(&self, session_id: &str) -> Result<Vec<Job>, StoreError> {
        let doc = self.load_session(session_id)?;
        let mut jobs: Vec<Job> = doc
            .outbox
            .iter()
            .filter(|entry| !entry.delivered)
            .filter_map(|entry| doc.job(&entry.job_id))
            .filter(|job| job.status == JobStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    /// Startup recovery: jobs stuck in `enqueued` or `running` revert to
    /// `pending` with their outbox entries undelivered, so the poller hands
    /// them out again. Safe under at-least-once delivery because handlers
    /// are idempotent.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let mut reverted = 0;
        for session_id in self.list_sessions()? {
            reverted += self.with_doc(&session_id, |doc| {
                let mut count = 0;
                let stuck: Vec<String> = doc
                    .jobs
                    .iter()
                    .filter(|j| matches!(j.status, JobStatus::Enqueued | JobStatus::Running))
                    .map(|j| j.id.clone())
                    .collect();
                for job_id in stuck {
                    if let Some(job) = doc.job_mut(&job_id) {
                        job.status = JobStatus::Pending;
                        job.updated_at = Utc::now();
                    }
                    if let Some(entry) = doc.outbox_mut(&job_id) {
                        entry.delivered = false;
                        entry.enqueued_at = None;
                    }
                    count += 1;
                }
                Ok(count)
            })?;
        }
        if reverted > 0 {
            tracing::info!(reverted, "recovered in-flight jobs to pending");
        }
        Ok(reverted)
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
