//! # Conveyor Queue
//!
//! A PostgreSQL-backed lease-based work queue for short-lived, stateless
//! workers coordinating a multi-phase content pipeline.
//!
//! ## Features
//!
//! - **Lease-based locking**: Per-row conditional updates are the only mutual
//!   exclusion; candidate reads are hints and never a correctness mechanism
//! - **Crash recovery by expiry**: Abandoned leases are reclaimed by sweeps,
//!   not heartbeats or worker-side bookkeeping
//! - **Fenced settlement**: Completions and failures carry the worker's token,
//!   so results from a lapsed lease are discarded instead of applied
//! - **Advisory sharding**: Workers spread lock contention statistically over
//!   randomized candidate pages; sharding biases, never partitions
//! - **Exactly-once fan-out**: The worker that drains a batch advances its
//!   phase through a compare-and-swap and only the winner fires the trigger
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobWorker                            │
//! │  (sweep, acquire, concurrent dispatch, settle, drain check) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobStore                             │
//! │  (PostgreSQL: conveyor_jobs, batches, stage messages)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 StageConsumer / FanoutTrigger                │
//! │  (sequences pipeline phases, triggers the next stage)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_queue::prelude::*;
//!
//! struct DraftProcessor;
//!
//! #[async_trait::async_trait]
//! impl JobProcessor for DraftProcessor {
//!     async fn process(&self, job: &LockedJob) -> ProcessOutcome {
//!         match &job.payload {
//!             JobPayload::SectionDraft { .. } => ProcessOutcome::Success,
//!             _ => ProcessOutcome::Failure("unsupported payload".into()),
//!         }
//!     }
//! }
//!
//! let store = Arc::new(InMemoryJobStore::new());
//! let fanout = Arc::new(StageFanout::new(store.clone(), "pipeline"));
//! let config = WorkerConfig::new().with_batch_id("batch-1");
//! let worker = JobWorker::new(store, Arc::new(DraftProcessor), fanout, config);
//! let report = worker.run().await;
//! ```

pub mod fanout;
pub mod job;
pub mod lock;
pub mod persistence;
pub mod retry;
pub mod shard;
pub mod stage;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::fanout::{finish_drained_batch, DrainOutcome, FanoutTrigger, StageFanout};
    pub use crate::job::{BatchPhase, JobPayload, JobRecord};
    pub use crate::lock::LockManager;
    pub use crate::persistence::{
        CompletionOutcome, FailureOutcome, InMemoryJobStore, JobStore, LockedJob, NewJob,
        PostgresJobStore, StageMessage, StoreError,
    };
    pub use crate::retry::{BackoffMode, RetryPolicy};
    pub use crate::stage::{StageConsumer, StagePoll};
    pub use crate::worker::{
        JobProcessor, JobWorker, ProcessOutcome, WorkerConfig, WorkerRunReport, WorkerRunStats,
    };
}

// Re-export key types at crate root
pub use fanout::{finish_drained_batch, DrainOutcome, FanoutTrigger, StageFanout};
pub use job::{BatchPhase, JobPayload, JobRecord};
pub use lock::LockManager;
pub use persistence::{
    CompletionOutcome, FailureOutcome, InMemoryJobStore, JobStore, LockedJob, NewJob,
    PostgresJobStore, StageMessage, StoreError,
};
pub use retry::{BackoffMode, RetryPolicy};
pub use shard::{select_candidates, shard_of};
pub use stage::{StageConsumer, StagePoll};
pub use worker::{
    JobProcessor, JobWorker, ProcessOutcome, WorkerConfig, WorkerRunReport, WorkerRunStats,
};
