//! The outbox poller: drains unenqueued jobs on a fixed period.
//!
//! Each tick walks every session's pending jobs. Against a broker-backed
//! queue the poller enqueues and marks the outbox entry delivered; against
//! the null queue it claims the job the same way and then executes the
//! handler inline, serialized per session by the walk order. A delivery
//! failure leaves the job pending for the next tick.

use crate::engine::Engine;
use crate::jobs::worker::JobWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct OutboxPoller {
    engine: Arc<Engine>,
    worker: JobWorker,
}

impl OutboxPoller {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        let worker = JobWorker::new(engine.clone());
        Self { engine, worker }
    }

    /// One drain pass over every session. Returns the number of jobs
    /// dispatched (enqueued or executed inline).
    pub async fn poll_once(&self) -> usize {
        let store = self.engine.store();
        let sessions = match store.list_sessions() {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::warn!(error = %err, "outbox poll could not list sessions");
                return 0;
            }
        };

        let inline = self.engine.queue().worker_hint() == "null";
        let mut dispatched = 0;
        for session_id in sessions {
            let jobs = match store.list_pending_jobs(&session_id) {
                Ok(jobs) => jobs,
                Err(err) => {
                    tracing::warn!(session = %session_id, error = %err, "pending job scan failed");
                    continue;
                }
            };
            for job in jobs {
                if inline {
                    // claim first, then execute on this process
                    if let Err(err) = store.mark_job_enqueued(&session_id, &job.id) {
                        tracing::warn!(job = %job.id, error = %err, "outbox claim failed");
                        continue;
                    }
                    dispatched += 1;
                    if let Err(err) = self.worker.run_job(&session_id, &job.id).await {
                        tracing::warn!(job = %job.id, error = %err, "inline job execution failed");
                    }
                } else {
                    match self.engine.queue().enqueue(&job).await {
                        Ok(queue_id) => {
                            tracing::debug!(job = %job.id, queue_id, "job enqueued");
                            if let Err(err) = store.mark_job_enqueued(&session_id, &job.id) {
                                tracing::warn!(job = %job.id, error = %err, "outbox mark failed");
                            }
                            dispatched += 1;
                        }
                        Err(err) => {
                            // stays pending; retried next tick
                            tracing::warn!(job = %job.id, error = %err, "enqueue failed");
                        }
                    }
                }
            }
        }
        dispatched
    }

    /// Spawns the periodic loop using the configured poll interval.
    pub fn spawn(engine: Arc<Engine>) -> JoinHandle<()> {
        let poller = Self::new(engine.clone());
        let period = Duration::from_millis(engine.config().poll_interval_ms.max(1));
        tokio::spawn(async move {
            tracing::info!(period_ms = period.as_millis() as u64, "outbox poller started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                poller.poll_once().await;
            }
        })
    }
}
