//! Persisted session tree: sessions, branches, rounds, snapshots, jobs, and
//! the outbox.
//!
//! These are explicit serde-friendly shapes, decoupled from runtime state.
//! Records reference each other by id only; resolution always goes through
//! the [`SessionStore`](super::SessionStore), so the branch graph stays a
//! DAG of ids with no in-memory back-references.

use crate::item::Item;
use crate::message::ChatMessage;
use crate::node::Metrics;
use crate::state::StateMap;
use crate::types::FlowRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of one player-send cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Open,
    Blocked,
    Completed,
    Failed,
}

/// Job families dispatched by the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Gating state refresh derived from the round's reply.
    StatusUpdate,
    /// Non-blocking story guidance for the next prompt.
    Guidance,
    /// Non-blocking transcript summarization.
    Summarize,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::StatusUpdate => "StatusUpdate",
            JobKind::Guidance => "Guidance",
            JobKind::Summarize => "Summarize",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Enqueued,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    #[serde(default)]
    pub parent_branch_id: Option<String>,
    /// Round on the parent this branch forked from.
    #[serde(default)]
    pub parent_round_no: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    pub branch_id: String,
    pub round_no: u64,
    pub status: RoundStatus,
    /// Ids of unfinished blocking jobs. Non-empty iff status is Blocked.
    #[serde(default)]
    pub blockers: Vec<String>,
    pub anchor_snapshot_id: String,
    pub user_input: String,
    #[serde(default)]
    pub llm_reply: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<Item>>,
    #[serde(default)]
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub logs: Vec<String>,
    /// Message transcript the reply was generated from.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub branch_id: String,
    pub taken_at_round_no: u64,
    /// Immutable once written.
    pub lss_copy: StateMap,
    /// Turn range `[start, end]` this anchor covers; the round's Summarize
    /// job takes it as its coverage window.
    pub range: [u64; 2],
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub blocking: bool,
    pub session_id: String,
    pub branch_id: String,
    pub round_no: u64,
    /// Subflow the worker runs for this job.
    #[serde(rename = "ref")]
    pub reference: FlowRef,
    pub input_payload: Value,
    pub idempotency_key: String,
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub job_id: String,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    pub delivered: bool,
}

/// The canonical per-session document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionDoc {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub active_branch_id: String,
    pub branches: Vec<Branch>,
    pub rounds: Vec<Round>,
    pub snapshots: Vec<Snapshot>,
    pub jobs: Vec<Job>,
    pub outbox: Vec<OutboxEntry>,
    /// Last stable state.
    pub lss: StateMap,
}

impl SessionDoc {
    #[must_use]
    pub fn branch(&self, branch_id: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.id == branch_id)
    }

    #[must_use]
    pub fn round(&self, branch_id: &str, round_no: u64) -> Option<&Round> {
        self.rounds
            .iter()
            .find(|r| r.branch_id == branch_id && r.round_no == round_no)
    }

    pub fn round_mut(&mut self, branch_id: &str, round_no: u64) -> Option<&mut Round> {
        self.rounds
            .iter_mut()
            .find(|r| r.branch_id == branch_id && r.round_no == round_no)
    }

    /// The newest round on a branch, by round number.
    #[must_use]
    pub fn latest_round(&self, branch_id: &str) -> Option<&Round> {
        self.rounds
            .iter()
            .filter(|r| r.branch_id == branch_id)
            .max_by_key(|r| r.round_no)
    }

    /// Next round number for a branch: one past the newest round, or one
    /// past the fork point for a branch that has not run yet.
    #[must_use]
    pub fn next_round_no(&self, branch_id: &str) -> u64 {
        let last = self.latest_round(branch_id).map(|r| r.round_no);
        let fork = self
            .branch(branch_id)
            .and_then(|b| b.parent_round_no)
            .unwrap_or(0);
        last.unwrap_or(0).max(fork) + 1
    }

    #[must_use]
    pub fn snapshot(&self, snapshot_id: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == snapshot_id)
    }

    #[must_use]
    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    pub fn outbox_mut(&mut self, job_id: &str) -> Option<&mut OutboxEntry> {
        self.outbox.iter_mut().find(|e| e.job_id == job_id)
    }
}
