//! JobStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::job::{BatchPhase, JobPayload, JobRecord};
use crate::retry::RetryPolicy;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Batch not found
    #[error("batch not found: {0}")]
    BatchNotFound(String),

    /// Phase transition not in the transition table
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidPhaseTransition { from: BatchPhase, to: BatchPhase },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Definition of a job to be enqueued
#[derive(Debug, Clone)]
pub struct NewJob {
    pub batch_id: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub max_retries: u32,
}

impl NewJob {
    /// Create a job definition with default priority and retry ceiling
    pub fn new(batch_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            batch_id: batch_id.into(),
            payload,
            priority: 0,
            max_retries: 2,
        }
    }

    /// Set the priority (higher is selected first within a page)
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A job a worker holds a lease on
#[derive(Debug, Clone)]
pub struct LockedJob {
    pub id: Uuid,
    pub batch_id: String,
    pub payload: JobPayload,
    pub retry_count: u32,
    pub max_retries: u32,
    pub locked_until: DateTime<Utc>,
}

/// Result of a fenced completion write
///
/// Completion is idempotent: an `AlreadyCompleted` result is a no-op success
/// for the caller, never a reprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The write was accepted; completed_at is now set
    Completed,

    /// completed_at was already set; nothing changed
    AlreadyCompleted,

    /// The writer no longer holds the lock; nothing was written
    LostLock,
}

/// Result of a fenced failure write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Lock released; the job is immediately re-acquirable
    Requeued { retry_count: u32 },

    /// Row hidden from selection until `next_retry_at`
    Deferred {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },

    /// Retry ceiling reached; completed_at set with the error retained
    Terminal { retry_count: u32 },

    /// The writer no longer holds the lock; nothing was written
    LostLock,

    /// completed_at was already set; nothing changed
    AlreadyCompleted,
}

/// A message on the coarse stage queue
#[derive(Debug, Clone)]
pub struct StageMessage {
    pub id: Uuid,
    pub queue: String,
    pub stage: BatchPhase,
    pub batch_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
}

/// Durable store backing the job queue
///
/// All job mutation is single-row and conditional; the conditional predicate
/// is the correctness guarantee, not the candidate SELECT that precedes it.
/// Implementations must be safe under unbounded cross-process concurrency.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Enqueue a job
    async fn enqueue_job(&self, job: NewJob) -> Result<Uuid, StoreError>;

    /// Fetch a job row for diagnostics
    async fn get_job(&self, job_id: Uuid) -> Result<JobRecord, StoreError>;

    /// Count rows currently selectable as candidates
    ///
    /// Selectable means unlocked, not completed, and past any `next_retry_at`.
    async fn available_count(&self, batch_id: Option<&str>) -> Result<u64, StoreError>;

    /// Read a page of candidate ids starting at `offset`
    ///
    /// The result is only a hint; every id must still win [`Self::try_lock`].
    async fn fetch_candidates(
        &self,
        batch_id: Option<&str>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Attempt to lock one job with a conditional single-row update
    ///
    /// Sets locked_by/locked_at/locked_until WHERE the row is unlocked, not
    /// completed, and past any retry deferral. Returns the locked row iff
    /// exactly one row was affected; a lost race returns `None`.
    async fn try_lock(
        &self,
        job_id: Uuid,
        worker_token: &str,
        lease: Duration,
    ) -> Result<Option<LockedJob>, StoreError>;

    /// Clear the lock fields so any worker can re-acquire the job
    async fn release_lock(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Clear lock fields on every row whose lease has expired
    ///
    /// Recovers jobs abandoned by crashed or timed-out workers without any
    /// cooperation from the crashed worker. Returns the number released.
    async fn sweep_expired(&self, batch_id: Option<&str>) -> Result<u64, StoreError>;

    /// Fenced, idempotent completion
    ///
    /// Accepted only while `locked_by` still equals `worker_token`; a slow,
    /// superseded holder gets [`CompletionOutcome::LostLock`] and writes
    /// nothing, so it can never overwrite a faster retry's result.
    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_token: &str,
    ) -> Result<CompletionOutcome, StoreError>;

    /// Fenced failure: bump retry_count and requeue, defer, or go terminal
    ///
    /// The retry ceiling comes from the row's `max_retries`; `policy` decides
    /// whether a retryable failure releases immediately or stamps
    /// `next_retry_at`.
    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_token: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, StoreError>;

    /// Authoritative count of jobs in a batch not yet terminal
    async fn pending_count(&self, batch_id: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Batch Phase Operations
    // =========================================================================

    /// Create a batch in the given phase
    async fn create_batch(&self, batch_id: &str, phase: BatchPhase) -> Result<(), StoreError>;

    /// Read the current phase of a batch
    async fn batch_phase(&self, batch_id: &str) -> Result<BatchPhase, StoreError>;

    /// Compare-and-swap the batch phase
    ///
    /// Returns `true` iff the batch was in `from` and is now in `to`; a lost
    /// race returns `false`. A transition not in the table is an error.
    async fn advance_phase(
        &self,
        batch_id: &str,
        from: BatchPhase,
        to: BatchPhase,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Stage Queue Operations
    // =========================================================================

    /// Append a message to a stage queue
    async fn enqueue_stage(
        &self,
        queue: &str,
        stage: BatchPhase,
        batch_id: &str,
    ) -> Result<Uuid, StoreError>;

    /// Hand out at most one visible message, leasing it for `visibility`
    ///
    /// The lease lives in the store: `visible_at` is pushed forward so no
    /// other consumer sees the message until the timeout passes.
    async fn dequeue_stage(
        &self,
        queue: &str,
        visibility: Duration,
    ) -> Result<Option<StageMessage>, StoreError>;

    /// Permanently remove a handled message
    async fn archive_stage(&self, queue: &str, message_id: Uuid) -> Result<(), StoreError>;
}
