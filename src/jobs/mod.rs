//! Asynchronous post-processing around the player's send: the queue
//! abstraction, the job worker, and the outbox poller.

pub mod poller;
pub mod queue;
pub mod worker;

pub use poller::OutboxPoller;
pub use queue::{JobQueue, NullJobQueue, QueueError};
pub use worker::{JobWorker, WorkerError};
