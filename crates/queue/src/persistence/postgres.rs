//! PostgreSQL implementation of JobStore
//!
//! Production persistence. Every lock, completion, and failure write is a
//! single-row conditional UPDATE; the WHERE clause re-validates the
//! precondition atomically with the write, so `rows_affected == 1` is the
//! acquisition/fencing guarantee. The candidate SELECT that precedes a lock
//! attempt is only a hint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::job::{BatchPhase, JobPayload, JobRecord};
use crate::retry::RetryPolicy;

/// PostgreSQL implementation of JobStore
///
/// Uses a connection pool for efficient access. Safe under unbounded
/// cross-process concurrency: workers share no memory, only these rows.
///
/// # Example
///
/// ```ignore
/// use conveyor_queue::PostgresJobStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/conveyor").await?;
/// let store = PostgresJobStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode_payload(value: serde_json::Value) -> Result<JobPayload, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_phase(s: &str) -> Result<BatchPhase, StoreError> {
    s.parse().map_err(StoreError::Serialization)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job))]
    async fn enqueue_job(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let job_id = Uuid::now_v7();
        let payload_json = serde_json::to_value(&job.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO conveyor_jobs (id, batch_id, payload, priority, retry_count, max_retries)
            VALUES ($1, $2, $3, $4, 0, $5)
            "#,
        )
        .bind(job_id)
        .bind(&job.batch_id)
        .bind(&payload_json)
        .bind(job.priority)
        .bind(job.max_retries as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(%job_id, kind = job.payload.kind(), "enqueued job");
        Ok(job_id)
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, batch_id, payload, priority, locked_by, locked_at, locked_until,
                   completed_at, error, retry_count, max_retries, next_retry_at, created_at
            FROM conveyor_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get job: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::JobNotFound(job_id))?;

        Ok(JobRecord {
            id: row.get("id"),
            batch_id: row.get("batch_id"),
            payload: decode_payload(row.get("payload"))?,
            priority: row.get("priority"),
            locked_by: row.get("locked_by"),
            locked_at: row.get("locked_at"),
            locked_until: row.get("locked_until"),
            completed_at: row.get("completed_at"),
            error: row.get("error"),
            retry_count: row.get::<i32, _>("retry_count") as u32,
            max_retries: row.get::<i32, _>("max_retries") as u32,
            next_retry_at: row.get("next_retry_at"),
            created_at: row.get("created_at"),
        })
    }

    #[instrument(skip(self))]
    async fn available_count(&self, batch_id: Option<&str>) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM conveyor_jobs
            WHERE completed_at IS NULL
              AND locked_by IS NULL
              AND (next_retry_at IS NULL OR next_retry_at <= NOW())
              AND ($1::text IS NULL OR batch_id = $1)
            "#,
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count available jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.get::<i64, _>("n") as u64)
    }

    #[instrument(skip(self))]
    async fn fetch_candidates(
        &self,
        batch_id: Option<&str>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM conveyor_jobs
            WHERE completed_at IS NULL
              AND locked_by IS NULL
              AND (next_retry_at IS NULL OR next_retry_at <= NOW())
              AND ($1::text IS NULL OR batch_id = $1)
            ORDER BY priority DESC, created_at
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(batch_id)
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch candidates: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn try_lock(
        &self,
        job_id: Uuid,
        worker_token: &str,
        lease: Duration,
    ) -> Result<Option<LockedJob>, StoreError> {
        // The WHERE clause is the compare-and-swap: of two racing workers,
        // exactly one sees its row affected.
        let row = sqlx::query(
            r#"
            UPDATE conveyor_jobs
            SET locked_by = $2,
                locked_at = NOW(),
                locked_until = NOW() + make_interval(secs => $3)
            WHERE id = $1
              AND locked_by IS NULL
              AND completed_at IS NULL
              AND (next_retry_at IS NULL OR next_retry_at <= NOW())
            RETURNING id, batch_id, payload, retry_count, max_retries, locked_until
            "#,
        )
        .bind(job_id)
        .bind(worker_token)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to lock job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        // A row whose payload no longer decodes must never reach a
        // processor; fail it terminally instead of poisoning every cycle.
        let payload = match decode_payload(row.get("payload")) {
            Ok(payload) => payload,
            Err(e) => {
                error!(%job_id, "undecodable payload, failing job terminally: {}", e);
                sqlx::query(
                    r#"
                    UPDATE conveyor_jobs
                    SET completed_at = NOW(), error = $2,
                        locked_by = NULL, locked_at = NULL, locked_until = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(format!("undecodable payload: {e}"))
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
                return Ok(None);
            }
        };

        Ok(Some(LockedJob {
            id: row.get("id"),
            batch_id: row.get("batch_id"),
            payload,
            retry_count: row.get::<i32, _>("retry_count") as u32,
            max_retries: row.get::<i32, _>("max_retries") as u32,
            locked_until: row.get::<DateTime<Utc>, _>("locked_until"),
        }))
    }

    #[instrument(skip(self))]
    async fn release_lock(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE conveyor_jobs
            SET locked_by = NULL, locked_at = NULL, locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to release lock: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn sweep_expired(&self, batch_id: Option<&str>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE conveyor_jobs
            SET locked_by = NULL, locked_at = NULL, locked_until = NULL
            WHERE locked_by IS NOT NULL
              AND completed_at IS NULL
              AND locked_until < NOW()
              AND ($1::text IS NULL OR batch_id = $1)
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to sweep expired locks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let released = result.rows_affected();
        if released > 0 {
            debug!(released, "swept expired locks");
        }
        Ok(released)
    }

    #[instrument(skip(self))]
    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_token: &str,
    ) -> Result<CompletionOutcome, StoreError> {
        // Fenced write: only the current lock holder may complete.
        let result = sqlx::query(
            r#"
            UPDATE conveyor_jobs
            SET completed_at = NOW(),
                error = NULL,
                locked_by = NULL, locked_at = NULL, locked_until = NULL
            WHERE id = $1
              AND completed_at IS NULL
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_token)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 1 {
            debug!(%job_id, "completed job");
            return Ok(CompletionOutcome::Completed);
        }

        // Distinguish the two no-write cases for the caller
        let row = sqlx::query(r#"SELECT completed_at FROM conveyor_jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::JobNotFound(job_id))?;

        let completed_at: Option<DateTime<Utc>> = row.get("completed_at");
        if completed_at.is_some() {
            Ok(CompletionOutcome::AlreadyCompleted)
        } else {
            Ok(CompletionOutcome::LostLock)
        }
    }

    #[instrument(skip(self, policy))]
    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_token: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT retry_count, max_retries, completed_at, locked_by
            FROM conveyor_jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::JobNotFound(job_id))?;

        let completed_at: Option<DateTime<Utc>> = row.get("completed_at");
        if completed_at.is_some() {
            return Ok(FailureOutcome::AlreadyCompleted);
        }
        let locked_by: Option<String> = row.get("locked_by");
        if locked_by.as_deref() != Some(worker_token) {
            return Ok(FailureOutcome::LostLock);
        }

        let prior_retries = row.get::<i32, _>("retry_count") as u32;
        let max_retries = row.get::<i32, _>("max_retries") as u32;
        let retry_count = prior_retries + 1;

        if retry_count >= max_retries {
            sqlx::query(
                r#"
                UPDATE conveyor_jobs
                SET retry_count = $2, error = $3, completed_at = NOW(),
                    locked_by = NULL, locked_at = NULL, locked_until = NULL
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(retry_count as i32)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            tx.commit()
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

            debug!(%job_id, retry_count, "job failed terminally");
            return Ok(FailureOutcome::Terminal { retry_count });
        }

        let next_retry_at = policy.next_retry_at(Utc::now(), prior_retries);
        sqlx::query(
            r#"
            UPDATE conveyor_jobs
            SET retry_count = $2, error = $3, next_retry_at = $4,
                locked_by = NULL, locked_at = NULL, locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(retry_count as i32)
        .bind(error)
        .bind(next_retry_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        match next_retry_at {
            Some(next_retry_at) => Ok(FailureOutcome::Deferred {
                retry_count,
                next_retry_at,
            }),
            None => Ok(FailureOutcome::Requeued { retry_count }),
        }
    }

    #[instrument(skip(self))]
    async fn pending_count(&self, batch_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM conveyor_jobs
            WHERE batch_id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count pending jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.get::<i64, _>("n") as u64)
    }

    #[instrument(skip(self))]
    async fn create_batch(&self, batch_id: &str, phase: BatchPhase) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conveyor_batches (batch_id, phase)
            VALUES ($1, $2)
            "#,
        )
        .bind(batch_id)
        .bind(phase.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create batch: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn batch_phase(&self, batch_id: &str) -> Result<BatchPhase, StoreError> {
        let row = sqlx::query(r#"SELECT phase FROM conveyor_batches WHERE batch_id = $1"#)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get batch phase: {}", e);
                StoreError::Database(e.to_string())
            })?
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;

        parse_phase(row.get::<String, _>("phase").as_str())
    }

    #[instrument(skip(self))]
    async fn advance_phase(
        &self,
        batch_id: &str,
        from: BatchPhase,
        to: BatchPhase,
    ) -> Result<bool, StoreError> {
        if !from.can_advance_to(to) {
            return Err(StoreError::InvalidPhaseTransition { from, to });
        }

        let result = sqlx::query(
            r#"
            UPDATE conveyor_batches
            SET phase = $3, updated_at = NOW()
            WHERE batch_id = $1 AND phase = $2
            "#,
        )
        .bind(batch_id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to advance phase: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 1 {
            debug!(batch_id, %from, %to, "advanced batch phase");
            return Ok(true);
        }

        // Lost CAS or missing batch; tell the caller which
        let exists = sqlx::query(r#"SELECT 1 AS one FROM conveyor_batches WHERE batch_id = $1"#)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if exists.is_none() {
            return Err(StoreError::BatchNotFound(batch_id.to_string()));
        }
        Ok(false)
    }

    #[instrument(skip(self))]
    async fn enqueue_stage(
        &self,
        queue: &str,
        stage: BatchPhase,
        batch_id: &str,
    ) -> Result<Uuid, StoreError> {
        let message_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO conveyor_stage_messages (id, queue, stage, batch_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(message_id)
        .bind(queue)
        .bind(stage.to_string())
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue stage message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(%message_id, queue, %stage, "enqueued stage message");
        Ok(message_id)
    }

    #[instrument(skip(self))]
    async fn dequeue_stage(
        &self,
        queue: &str,
        visibility: Duration,
    ) -> Result<Option<StageMessage>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE conveyor_stage_messages
            SET visible_at = NOW() + make_interval(secs => $2)
            WHERE id = (
                SELECT id
                FROM conveyor_stage_messages
                WHERE queue = $1 AND visible_at <= NOW()
                ORDER BY enqueued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue, stage, batch_id, enqueued_at, visible_at
            "#,
        )
        .bind(queue)
        .bind(visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to dequeue stage message: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        Ok(Some(StageMessage {
            id: row.get("id"),
            queue: row.get("queue"),
            stage: parse_phase(row.get::<String, _>("stage").as_str())?,
            batch_id: row.get("batch_id"),
            enqueued_at: row.get("enqueued_at"),
            visible_at: row.get("visible_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn archive_stage(&self, queue: &str, message_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM conveyor_stage_messages WHERE queue = $1 AND id = $2"#)
            .bind(queue)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to archive stage message: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(())
    }
}
