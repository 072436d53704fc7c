//! ```text
//! ChatPipeline ─┬─► SessionStore ── session.json (atomic replace)
//!               │        │
//!               │        └─► Outbox ─► OutboxPoller ─► JobWorker
//!               │                                        │
//!               ├─► FlowExecutor ─► Registry ─► Nodes    │
//!               │        │                     │         │
//!               │        └── Subflows ◄────────┼─────────┘
//!               │                              │
//!               └─► StateManager (Working / LSS, pending fallback)
//!                                              │
//!                                        LlmAdapter ─► TrafficLog
//! ```
//!
//! Taleloom is a backend workflow engine for LLM-driven interactive-fiction
//! sessions. Declarative workflow documents of composable nodes flow arrays
//! of records between transforms; durable sessions branch and snapshot
//! around one canonical anchor, the player's send; and two classes of
//! asynchronous post-processing jobs (round-gating and non-blocking) run
//! behind an outbox with at-least-once, idempotent delivery.

pub mod config;
pub mod engine;
pub mod executor;
pub mod expr;
pub mod funcs;
pub mod ir;
pub mod item;
pub mod jobs;
pub mod llm;
pub mod message;
pub mod node;
pub mod nodes;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod state;
pub mod store;
pub mod types;
