//! In-memory implementation of JobStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::job::{BatchPhase, JobRecord};
use crate::retry::RetryPolicy;

/// In-memory implementation of JobStore
///
/// Primarily for testing. It keeps the same lease, fencing, and retry
/// semantics as the PostgreSQL implementation, including real timestamps,
/// so expiry sweeps and racing workers behave the same way in unit tests.
///
/// # Example
///
/// ```
/// use conveyor_queue::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// ```
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
    batches: RwLock<HashMap<String, BatchPhase>>,
    stages: RwLock<HashMap<String, Vec<StageMessage>>>,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            batches: RwLock::new(HashMap::new()),
            stages: RwLock::new(HashMap::new()),
        }
    }

    /// Total number of job rows, terminal ones included
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Number of messages sitting on a stage queue
    pub fn stage_depth(&self, queue: &str) -> usize {
        self.stages.read().get(queue).map_or(0, |q| q.len())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.jobs.write().clear();
        self.batches.write().clear();
        self.stages.write().clear();
    }

    fn selectable(job: &JobRecord, now: chrono::DateTime<chrono::Utc>) -> bool {
        job.completed_at.is_none()
            && job.locked_by.is_none()
            && job.next_retry_at.map_or(true, |at| at <= now)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue_job(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let job_id = Uuid::now_v7();
        let mut jobs = self.jobs.write();
        jobs.insert(
            job_id,
            JobRecord {
                id: job_id,
                batch_id: job.batch_id,
                payload: job.payload,
                priority: job.priority,
                locked_by: None,
                locked_at: None,
                locked_until: None,
                completed_at: None,
                error: None,
                retry_count: 0,
                max_retries: job.max_retries,
                next_retry_at: None,
                created_at: Utc::now(),
            },
        );
        Ok(job_id)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn available_count(&self, batch_id: Option<&str>) -> Result<u64, StoreError> {
        let now = Utc::now();
        let jobs = self.jobs.read();
        Ok(jobs
            .values()
            .filter(|j| batch_id.map_or(true, |b| j.batch_id == b))
            .filter(|j| Self::selectable(j, now))
            .count() as u64)
    }

    async fn fetch_candidates(
        &self,
        batch_id: Option<&str>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let jobs = self.jobs.read();
        let mut candidates: Vec<&JobRecord> = jobs
            .values()
            .filter(|j| batch_id.map_or(true, |b| j.batch_id == b))
            .filter(|j| Self::selectable(j, now))
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        Ok(candidates
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .map(|j| j.id)
            .collect())
    }

    async fn try_lock(
        &self,
        job_id: Uuid,
        worker_token: &str,
        lease: Duration,
    ) -> Result<Option<LockedJob>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let job = match jobs.get_mut(&job_id) {
            Some(j) => j,
            None => return Ok(None),
        };

        // Same predicate the SQL WHERE clause re-validates
        if !Self::selectable(job, now) {
            return Ok(None);
        }

        let until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        job.locked_by = Some(worker_token.to_string());
        job.locked_at = Some(now);
        job.locked_until = Some(until);

        Ok(Some(LockedJob {
            id: job.id,
            batch_id: job.batch_id.clone(),
            payload: job.payload.clone(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            locked_until: until,
        }))
    }

    async fn release_lock(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;

        job.locked_by = None;
        job.locked_at = None;
        job.locked_until = None;
        Ok(())
    }

    async fn sweep_expired(&self, batch_id: Option<&str>) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let mut released = 0;

        for job in jobs.values_mut() {
            if batch_id.map_or(false, |b| job.batch_id != b) {
                continue;
            }
            if job.completed_at.is_none() && job.lock_expired(now) {
                job.locked_by = None;
                job.locked_at = None;
                job.locked_until = None;
                released += 1;
            }
        }

        Ok(released)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_token: &str,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;

        if job.completed_at.is_some() {
            return Ok(CompletionOutcome::AlreadyCompleted);
        }
        if job.locked_by.as_deref() != Some(worker_token) {
            return Ok(CompletionOutcome::LostLock);
        }

        job.completed_at = Some(Utc::now());
        job.error = None;
        job.locked_by = None;
        job.locked_at = None;
        job.locked_until = None;
        Ok(CompletionOutcome::Completed)
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_token: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;

        if job.completed_at.is_some() {
            return Ok(FailureOutcome::AlreadyCompleted);
        }
        if job.locked_by.as_deref() != Some(worker_token) {
            return Ok(FailureOutcome::LostLock);
        }

        let deferral = policy.next_retry_at(now, job.retry_count);
        job.retry_count += 1;
        job.error = Some(error.to_string());
        job.locked_by = None;
        job.locked_at = None;
        job.locked_until = None;

        if job.retry_count >= job.max_retries {
            job.completed_at = Some(now);
            return Ok(FailureOutcome::Terminal {
                retry_count: job.retry_count,
            });
        }

        match deferral {
            Some(next_retry_at) => {
                job.next_retry_at = Some(next_retry_at);
                Ok(FailureOutcome::Deferred {
                    retry_count: job.retry_count,
                    next_retry_at,
                })
            }
            None => Ok(FailureOutcome::Requeued {
                retry_count: job.retry_count,
            }),
        }
    }

    async fn pending_count(&self, batch_id: &str) -> Result<u64, StoreError> {
        let jobs = self.jobs.read();
        Ok(jobs
            .values()
            .filter(|j| j.batch_id == batch_id && j.completed_at.is_none())
            .count() as u64)
    }

    async fn create_batch(&self, batch_id: &str, phase: BatchPhase) -> Result<(), StoreError> {
        self.batches.write().insert(batch_id.to_string(), phase);
        Ok(())
    }

    async fn batch_phase(&self, batch_id: &str) -> Result<BatchPhase, StoreError> {
        self.batches
            .read()
            .get(batch_id)
            .copied()
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))
    }

    async fn advance_phase(
        &self,
        batch_id: &str,
        from: BatchPhase,
        to: BatchPhase,
    ) -> Result<bool, StoreError> {
        if !from.can_advance_to(to) {
            return Err(StoreError::InvalidPhaseTransition { from, to });
        }

        let mut batches = self.batches.write();
        let phase = batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;

        if *phase != from {
            return Ok(false);
        }
        *phase = to;
        Ok(true)
    }

    async fn enqueue_stage(
        &self,
        queue: &str,
        stage: BatchPhase,
        batch_id: &str,
    ) -> Result<Uuid, StoreError> {
        let now = Utc::now();
        let message = StageMessage {
            id: Uuid::now_v7(),
            queue: queue.to_string(),
            stage,
            batch_id: batch_id.to_string(),
            enqueued_at: now,
            visible_at: now,
        };
        let id = message.id;
        self.stages
            .write()
            .entry(queue.to_string())
            .or_default()
            .push(message);
        Ok(id)
    }

    async fn dequeue_stage(
        &self,
        queue: &str,
        visibility: Duration,
    ) -> Result<Option<StageMessage>, StoreError> {
        let now = Utc::now();
        let mut stages = self.stages.write();
        let messages = match stages.get_mut(queue) {
            Some(m) => m,
            None => return Ok(None),
        };

        let candidate = messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .min_by_key(|m| m.enqueued_at);

        match candidate {
            Some(message) => {
                message.visible_at =
                    now + chrono::Duration::from_std(visibility).unwrap_or(chrono::Duration::MAX);
                Ok(Some(message.clone()))
            }
            None => Ok(None),
        }
    }

    async fn archive_stage(&self, queue: &str, message_id: Uuid) -> Result<(), StoreError> {
        let mut stages = self.stages.write();
        if let Some(messages) = stages.get_mut(queue) {
            messages.retain(|m| m.id != message_id);
        }
        Ok(())
    }
}
