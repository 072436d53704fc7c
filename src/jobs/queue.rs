//! The queue abstraction between the outbox and the worker.
//!
//! Two modes are supported. A broker-backed queue runs workers in separate
//! processes and implements this trait against its client library. The
//! bundled [`NullJobQueue`] has no broker at all: the outbox poller detects
//! it via [`JobQueue::worker_hint`] and executes handlers inline on the
//! server process instead of enqueueing.

use crate::store::model::Job;
use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("job queue unavailable: {message}")]
    #[diagnostic(
        code(taleloom::jobs::queue_unavailable),
        help("The outbox keeps the job pending; the poller retries next tick.")
    )]
    Unavailable { message: String },
}

/// Delivery contract the outbox poller drives.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Hands a job to the queue, returning the queue-side tracking id.
    async fn enqueue(&self, job: &Job) -> Result<String, QueueError>;

    /// Queue-side status for diagnostics.
    async fn status(&self, job_id: &str) -> Value;

    /// Implementation tag, e.g. "null" or "broker". The poller switches to
    /// inline execution when this returns "null".
    fn worker_hint(&self) -> &'static str {
        "internal"
    }
}

/// Brokerless queue: accepts jobs without executing anything.
#[derive(Debug, Default)]
pub struct NullJobQueue;

#[async_trait]
impl JobQueue for NullJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<String, QueueError> {
        tracing::warn!(job = %job.id, kind = %job.kind, "null queue accepted job without execution");
        Ok(job.id.clone())
    }

    async fn status(&self, job_id: &str) -> Value {
        json!({
            "id": job_id,
            "status": "pending",
            "queue": "null",
            "note": "no worker configured",
        })
    }

    fn worker_hint(&self) -> &'static str {
        "null"
    }
}
