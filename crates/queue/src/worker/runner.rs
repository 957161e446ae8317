//! The worker invocation loop
//!
//! Each invocation is short-lived and stateless: sweep expired leases,
//! acquire a small batch, dispatch it concurrently, settle every outcome,
//! and back off when the queue looks empty. Across invocations the only
//! coordination is the store's conditional updates; nothing here assumes
//! another worker exists or shares memory with it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::fanout::{finish_drained_batch, DrainOutcome, FanoutTrigger};
use crate::lock::LockManager;
use crate::persistence::{CompletionOutcome, FailureOutcome, JobStore, LockedJob};
use crate::retry::RetryPolicy;
use crate::shard::{select_candidates, shard_of};
use crate::worker::dispatch::{JobProcessor, ProcessOutcome};

/// Worker invocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identity; also the fencing token stamped into locked_by
    pub worker_id: String,

    /// Restrict acquisition and drain detection to one batch
    pub batch_id: Option<String>,

    /// Jobs acquired per cycle
    pub per_cycle_limit: usize,

    /// Hard bound on one invocation's lifetime
    #[serde(with = "duration_millis")]
    pub time_budget: Duration,

    /// Per-job dispatch timeout
    #[serde(with = "duration_millis")]
    pub dispatch_timeout: Duration,

    /// Lease duration stamped on acquired jobs
    #[serde(with = "duration_millis")]
    pub lease: Duration,

    /// Consecutive empty acquire cycles before the loop exits
    pub empty_streak_limit: u32,

    /// Sleep after an empty cycle, grown by the multiplier up to the max
    #[serde(with = "duration_millis")]
    pub min_backoff: Duration,

    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,

    pub backoff_multiplier: f64,

    /// Advisory shard count; 1 disables sharding
    pub total_shards: u32,

    /// Explicit shard override; derived from worker_id when unset
    pub shard_id: Option<u32>,

    /// Retry policy applied to failed dispatches
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::now_v7()),
            batch_id: None,
            per_cycle_limit: 5,
            time_budget: Duration::from_secs(55),
            dispatch_timeout: Duration::from_secs(30),
            lease: Duration::from_secs(120),
            empty_streak_limit: 3,
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            total_shards: 1,
            shard_id: None,
            retry: RetryPolicy::immediate(),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration with a generated worker id
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker identity
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Scope the invocation to one batch
    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// Set the per-cycle acquisition limit
    pub fn with_per_cycle_limit(mut self, limit: usize) -> Self {
        self.per_cycle_limit = limit.max(1);
        self
    }

    /// Set the invocation time budget
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    /// Set the per-job dispatch timeout
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Set the lease duration
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the empty-streak exit threshold
    pub fn with_empty_streak_limit(mut self, limit: u32) -> Self {
        self.empty_streak_limit = limit.max(1);
        self
    }

    /// Set the empty-cycle backoff bounds
    pub fn with_backoff(mut self, min: Duration, max: Duration, multiplier: f64) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the advisory shard layout
    pub fn with_shards(mut self, shard_id: Option<u32>, total_shards: u32) -> Self {
        self.shard_id = shard_id;
        self.total_shards = total_shards.max(1);
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The shard this worker polls for, explicit or derived
    pub fn effective_shard(&self) -> u32 {
        self.shard_id
            .unwrap_or_else(|| shard_of(&self.worker_id, self.total_shards))
    }
}

/// Aggregate counters for one invocation; never persisted beyond logs and
/// the trigger response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRunStats {
    pub worker_id: String,
    pub shard_id: u32,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Results superseded before settlement; the job's row was untouched
    pub discarded: u64,
    pub dependencies_enqueued: u64,
    pub swept: u64,
    pub cycles: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Everything one invocation produced
#[derive(Debug, Clone)]
pub struct WorkerRunReport {
    pub stats: WorkerRunStats,
    /// Drain decision for the scoped batch; `None` when unscoped
    pub drain: Option<DrainOutcome>,
}

/// One stateless worker invocation
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    fanout: Arc<dyn FanoutTrigger>,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl JobWorker {
    /// Create a worker invocation
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<dyn JobProcessor>,
        fanout: Arc<dyn FanoutTrigger>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            fanout,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts in-flight dispatches and ends the loop early
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run cycles until the time budget is spent or the queue stays empty
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run(&self) -> WorkerRunReport {
        let shard = self.config.effective_shard();
        let deadline = tokio::time::Instant::now() + self.config.time_budget;
        let lock_manager = LockManager::new(Arc::clone(&self.store), self.config.lease);
        let batch_scope = self.config.batch_id.as_deref();

        let mut stats = WorkerRunStats {
            worker_id: self.config.worker_id.clone(),
            shard_id: shard,
            processed: 0,
            succeeded: 0,
            failed: 0,
            discarded: 0,
            dependencies_enqueued: 0,
            swept: 0,
            cycles: 0,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };

        let mut empty_streak = 0u32;
        let mut backoff = self.config.min_backoff;

        while tokio::time::Instant::now() < deadline && !self.cancel.is_cancelled() {
            stats.cycles += 1;

            // Every cycle starts by reclaiming expired leases; the sweep is
            // idempotent, so concurrent workers doing the same is harmless.
            match lock_manager.sweep_expired(batch_scope).await {
                Ok(released) => stats.swept += released,
                Err(e) => {
                    warn!("lease sweep failed, backing off: {}", e);
                    if self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            }

            let candidates = match select_candidates(
                self.store.as_ref(),
                batch_scope,
                self.config.per_cycle_limit,
            )
            .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("candidate selection failed, backing off: {}", e);
                    if self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            let locked = match lock_manager
                .acquire(&self.config.worker_id, &candidates)
                .await
            {
                Ok(locked) => locked,
                Err(e) => {
                    warn!("acquisition failed, backing off: {}", e);
                    if self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            if locked.is_empty() {
                empty_streak += 1;
                if empty_streak >= self.config.empty_streak_limit {
                    debug!(empty_streak, "queue stayed empty, exiting cleanly");
                    break;
                }
                if self.sleep_backoff(&mut backoff).await {
                    break;
                }
                continue;
            }

            empty_streak = 0;
            backoff = self.config.min_backoff;
            self.dispatch_batch(locked, &mut stats).await;
        }

        stats.finished_at = Utc::now();
        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            discarded = stats.discarded,
            swept = stats.swept,
            cycles = stats.cycles,
            "worker invocation finished"
        );

        let drain = match batch_scope {
            Some(batch_id) => {
                match finish_drained_batch(self.store.as_ref(), self.fanout.as_ref(), batch_id)
                    .await
                {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        error!("drain check failed: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        WorkerRunReport { stats, drain }
    }

    /// Sleep the current backoff; returns true if cancelled during the sleep
    async fn sleep_backoff(&self, backoff: &mut Duration) -> bool {
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(*backoff) => false,
            _ = self.cancel.cancelled() => true,
        };
        *backoff = Duration::from_secs_f64(
            (backoff.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_backoff.as_secs_f64()),
        );
        cancelled
    }

    /// Dispatch every acquired job concurrently and settle all outcomes
    ///
    /// One job's failure never aborts settlement of its siblings.
    async fn dispatch_batch(&self, locked: Vec<LockedJob>, stats: &mut WorkerRunStats) {
        let mut join_set: JoinSet<(LockedJob, ProcessOutcome)> = JoinSet::new();

        for job in locked {
            let processor = Arc::clone(&self.processor);
            let cancel = self.cancel.child_token();
            let timeout = self.config.dispatch_timeout;

            join_set.spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        ProcessOutcome::Failure("dispatch cancelled".to_string())
                    }
                    result = tokio::time::timeout(timeout, processor.process(&job)) => {
                        match result {
                            Ok(outcome) => outcome,
                            Err(_) => ProcessOutcome::Failure(format!(
                                "dispatch timed out after {}ms",
                                timeout.as_millis()
                            )),
                        }
                    }
                };
                (job, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((job, outcome)) => self.settle(job, outcome, stats).await,
                Err(e) => {
                    // A panicked dispatch keeps its lease; the expiry sweep
                    // recovers the job.
                    error!("dispatch task failed to join: {}", e);
                }
            }
        }
    }

    /// Resolve one dispatch outcome to a row-level state change
    async fn settle(&self, job: LockedJob, outcome: ProcessOutcome, stats: &mut WorkerRunStats) {
        stats.processed += 1;
        let token = &self.config.worker_id;

        match outcome {
            ProcessOutcome::Success => {
                match self.store.complete_job(job.id, token).await {
                    Ok(CompletionOutcome::Completed) => {
                        stats.succeeded += 1;
                    }
                    Ok(CompletionOutcome::AlreadyCompleted) => {
                        // A late duplicate result; the first completion stands.
                        debug!(job_id = %job.id, "job was already completed");
                        stats.discarded += 1;
                    }
                    Ok(CompletionOutcome::LostLock) => {
                        debug!(job_id = %job.id, "lease reclaimed before completion, result discarded");
                        stats.discarded += 1;
                    }
                    Err(e) => {
                        error!(job_id = %job.id, "failed to record completion: {}", e);
                        stats.failed += 1;
                    }
                }
            }
            ProcessOutcome::Failure(dispatch_error) => {
                stats.failed += 1;
                match self
                    .store
                    .fail_job(job.id, token, &dispatch_error, &self.config.retry)
                    .await
                {
                    Ok(FailureOutcome::Terminal { retry_count }) => {
                        warn!(
                            job_id = %job.id,
                            retry_count,
                            error = %dispatch_error,
                            "job failed terminally"
                        );
                    }
                    Ok(FailureOutcome::Requeued { retry_count }) => {
                        debug!(job_id = %job.id, retry_count, "job requeued");
                    }
                    Ok(FailureOutcome::Deferred { retry_count, next_retry_at }) => {
                        debug!(job_id = %job.id, retry_count, %next_retry_at, "job deferred");
                    }
                    Ok(FailureOutcome::LostLock | FailureOutcome::AlreadyCompleted) => {
                        debug!(job_id = %job.id, "failure result superseded, nothing recorded");
                    }
                    Err(e) => {
                        error!(job_id = %job.id, "failed to record failure: {}", e);
                    }
                }
            }
            ProcessOutcome::MissingPrerequisite { dependency } => {
                // Not an error and not a retry: emit the dependency and put
                // the job back untouched for a later attempt.
                match self.store.enqueue_job(dependency).await {
                    Ok(dep_id) => {
                        info!(job_id = %job.id, dependency_id = %dep_id, "enqueued dependency job");
                        stats.dependencies_enqueued += 1;
                    }
                    Err(e) => {
                        error!(job_id = %job.id, "failed to enqueue dependency: {}", e);
                    }
                }
                if let Err(e) = self.store.release_lock(job.id).await {
                    error!(job_id = %job.id, "failed to release job for retry: {}", e);
                }
            }
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
