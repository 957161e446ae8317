// Background stage consumers
//
// There is no external scheduler: each pipeline phase has its own stage
// queue, and a consumer task per shard keeps running batch-scoped workers
// against it until the batch drains and the fan-out announces the next
// phase. A batch that is not drained within one run leaves its message
// leased, so it reappears after the visibility timeout and the drain
// continues where it left off.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use conveyor_queue::{
    BatchPhase, DrainOutcome, FanoutTrigger, JobProcessor, JobStore, JobWorker, RetryPolicy,
    StageConsumer, StageMessage, StoreError, WorkerConfig,
};

use crate::config::ServerConfig;

/// Phases a consumer actually runs work for
///
/// Drafting starts when the batch is created and Done has nothing to run, so
/// only the two middle phases get worker-driving consumers.
const RUNNABLE_PHASES: [BatchPhase; 2] = [BatchPhase::Assembling, BatchPhase::Publishing];

/// Stage queue name for a phase, namespaced by the configured prefix
pub fn phase_queue(prefix: &str, phase: BatchPhase) -> String {
    format!("{prefix}.{phase}")
}

/// Worker identity for one consumer task
///
/// The id doubles as the fencing token stamped into `locked_by`, so two
/// replicas of the same (phase, shard) consumer must never share one. The
/// uuid suffix keeps the token unique per task.
fn consumer_worker_id(phase: BatchPhase, shard: u32) -> String {
    format!("consumer-{phase}-s{shard}-{}", Uuid::now_v7())
}

/// Retry policy for one phase's jobs
///
/// Failed publishes wait out a deferred backoff window before becoming
/// visible again; every other phase releases the lock for an immediate
/// re-attempt.
pub fn phase_retry_policy(config: &ServerConfig, phase: BatchPhase) -> RetryPolicy {
    match phase {
        BatchPhase::Publishing => {
            RetryPolicy::deferred(config.publish_retry_base(), config.publish_retry_max())
        }
        _ => RetryPolicy::immediate(),
    }
}

/// Fan-out trigger that routes each announcement to its phase's own queue
pub struct PhaseQueueFanout {
    store: Arc<dyn JobStore>,
    prefix: String,
}

impl PhaseQueueFanout {
    pub fn new(store: Arc<dyn JobStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl FanoutTrigger for PhaseQueueFanout {
    async fn phase_complete(&self, batch_id: &str, next: BatchPhase) -> Result<(), StoreError> {
        let queue = phase_queue(&self.prefix, next);
        self.store.enqueue_stage(&queue, next, batch_id).await?;
        info!(batch_id, %next, queue, "announced next phase");
        Ok(())
    }
}

/// Spawn one consumer task per (runnable phase, shard), plus a drainer for
/// the done queue
pub fn spawn_consumers(
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    fanout: Arc<dyn FanoutTrigger>,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let prefix = config.queue_prefix();

    for phase in RUNNABLE_PHASES {
        for shard in 0..config.total_shards() {
            handles.push(tokio::spawn(consume_phase(
                Arc::clone(&store),
                Arc::clone(&processor),
                Arc::clone(&fanout),
                config.clone(),
                phase,
                shard,
                cancel.clone(),
            )));
        }
    }

    handles.push(tokio::spawn(drain_done_queue(
        Arc::clone(&store),
        phase_queue(&prefix, BatchPhase::Done),
        config.clone(),
        cancel.clone(),
    )));

    handles
}

/// Poll one phase queue and run batch-scoped workers for its messages
async fn consume_phase(
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    fanout: Arc<dyn FanoutTrigger>,
    config: ServerConfig,
    phase: BatchPhase,
    shard: u32,
    cancel: CancellationToken,
) {
    let queue = phase_queue(&config.queue_prefix(), phase);
    let worker_id = consumer_worker_id(phase, shard);
    let consumer = StageConsumer::new(Arc::clone(&store), queue.clone(), phase, config.visibility());
    info!(%worker_id, queue, "stage consumer started");

    while !cancel.is_cancelled() {
        let poll = consumer
            .poll(|message| {
                run_batch_worker(
                    Arc::clone(&store),
                    Arc::clone(&processor),
                    Arc::clone(&fanout),
                    &config,
                    &worker_id,
                    shard,
                    message,
                )
            })
            .await;

        match poll {
            Ok(conveyor_queue::StagePoll::Empty) | Err(_) => {
                if let Err(e) = &poll {
                    warn!(queue, "stage poll failed: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval()) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            Ok(_) => {}
        }
    }
    info!(%worker_id, "stage consumer stopped");
}

/// Handle one stage message: run a worker scoped to its batch until the time
/// budget is spent; an undrained batch is an Err so the message reappears
async fn run_batch_worker(
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    fanout: Arc<dyn FanoutTrigger>,
    config: &ServerConfig,
    worker_id: &str,
    shard: u32,
    message: StageMessage,
) -> Result<(), String> {
    let worker_config = WorkerConfig::new()
        .with_worker_id(worker_id)
        .with_batch_id(message.batch_id.clone())
        .with_per_cycle_limit(config.per_cycle_limit())
        .with_time_budget(config.time_budget())
        .with_dispatch_timeout(config.dispatch_timeout())
        .with_lease(config.lease())
        .with_shards(Some(shard), config.total_shards())
        .with_retry(phase_retry_policy(config, message.stage));

    let worker = JobWorker::new(store, processor, fanout, worker_config);
    let report = worker.run().await;
    info!(
        batch_id = %message.batch_id,
        processed = report.stats.processed,
        drain = ?report.drain,
        "stage message run finished"
    );

    match report.drain {
        Some(DrainOutcome::MoreWork) => Err(format!(
            "batch {} not drained within the time budget",
            message.batch_id
        )),
        // Phase advanced, someone else advanced it, or the pipeline is
        // finished; all of these retire the message.
        _ => Ok(()),
    }
}

/// The done queue only ever receives final-phase announcements; log and
/// retire them
async fn drain_done_queue(
    store: Arc<dyn JobStore>,
    queue: String,
    config: ServerConfig,
    cancel: CancellationToken,
) {
    let consumer = StageConsumer::new(store, queue.clone(), BatchPhase::Done, config.visibility());

    while !cancel.is_cancelled() {
        let poll = consumer
            .poll(|message| async move {
                info!(batch_id = %message.batch_id, "pipeline finished for batch");
                Ok(())
            })
            .await;

        match poll {
            Ok(conveyor_queue::StagePoll::Empty) | Err(_) => {
                if let Err(e) = &poll {
                    warn!(queue, "done-queue poll failed: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval()) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_queue::{InMemoryJobStore, JobPayload, LockedJob, NewJob, ProcessOutcome};
    use std::time::Duration;
    use uuid::Uuid;

    struct AlwaysOk;

    #[async_trait]
    impl JobProcessor for AlwaysOk {
        async fn process(&self, _job: &LockedJob) -> ProcessOutcome {
            ProcessOutcome::Success
        }
    }

    fn fast_config() -> ServerConfig {
        ServerConfig {
            poll_interval_ms: Some(5),
            visibility_ms: Some(200),
            time_budget_ms: Some(2_000),
            dispatch_timeout_ms: Some(500),
            lease_ms: Some(10_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_phase_queue_naming() {
        assert_eq!(
            phase_queue("conveyor", BatchPhase::Assembling),
            "conveyor.assembling"
        );
    }

    #[test]
    fn test_consumer_replicas_get_distinct_fencing_tokens() {
        // Two server replicas spawn the same (phase, shard) consumer; if
        // their tokens collided, a stale replica's settlement would still
        // match locked_by after a sweep and relock.
        let a = consumer_worker_id(BatchPhase::Assembling, 0);
        let b = consumer_worker_id(BatchPhase::Assembling, 0);
        assert!(a.starts_with("consumer-assembling-s0-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_retry_policy_deferred_only_for_publishing() {
        let config = ServerConfig::default();
        assert_eq!(
            phase_retry_policy(&config, BatchPhase::Publishing),
            RetryPolicy::deferred(config.publish_retry_base(), config.publish_retry_max())
        );
        assert_eq!(
            phase_retry_policy(&config, BatchPhase::Assembling),
            RetryPolicy::immediate()
        );
    }

    #[tokio::test]
    async fn test_failed_publish_defers_instead_of_requeueing() {
        struct FailingPublisher;

        #[async_trait]
        impl JobProcessor for FailingPublisher {
            async fn process(&self, _job: &LockedJob) -> ProcessOutcome {
                ProcessOutcome::Failure("target returned 503".to_string())
            }
        }

        let store = Arc::new(InMemoryJobStore::new());
        store
            .create_batch("b1", BatchPhase::Publishing)
            .await
            .unwrap();
        let job_id = store
            .enqueue_job(NewJob::new(
                "b1",
                JobPayload::Publish {
                    article_id: Uuid::now_v7(),
                    target: "cms".to_string(),
                },
            ))
            .await
            .unwrap();

        let config = fast_config();
        let fanout: Arc<dyn FanoutTrigger> =
            Arc::new(PhaseQueueFanout::new(store.clone(), "conveyor"));
        let now = chrono::Utc::now();
        let message = StageMessage {
            id: Uuid::now_v7(),
            queue: "conveyor.publishing".to_string(),
            stage: BatchPhase::Publishing,
            batch_id: "b1".to_string(),
            enqueued_at: now,
            visible_at: now,
        };

        let result = run_batch_worker(
            store.clone() as Arc<dyn JobStore>,
            Arc::new(FailingPublisher),
            fanout,
            &config,
            "consumer-publishing-s0-t1",
            0,
            message,
        )
        .await;

        // The deferred job keeps the batch pending, so the message reappears
        assert!(result.is_err());

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.retry_count, 1);
        assert!(job.completed_at.is_none());
        assert!(job.next_retry_at.unwrap() > chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_phase_fanout_routes_to_phase_queue() {
        let store = Arc::new(InMemoryJobStore::new());
        let fanout = PhaseQueueFanout::new(store.clone(), "conveyor");

        fanout
            .phase_complete("b1", BatchPhase::Publishing)
            .await
            .unwrap();

        assert_eq!(store.stage_depth("conveyor.publishing"), 1);
        assert_eq!(store.stage_depth("conveyor.assembling"), 0);
    }

    #[tokio::test]
    async fn test_consumer_drains_announced_batch() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .create_batch("b1", BatchPhase::Assembling)
            .await
            .unwrap();
        store
            .enqueue_job(NewJob::new(
                "b1",
                JobPayload::SectionDraft {
                    article_id: Uuid::now_v7(),
                    section_key: "assembled".to_string(),
                },
            ))
            .await
            .unwrap();
        store
            .enqueue_stage("conveyor.assembling", BatchPhase::Assembling, "b1")
            .await
            .unwrap();

        let config = fast_config();
        let cancel = CancellationToken::new();
        let fanout: Arc<dyn FanoutTrigger> =
            Arc::new(PhaseQueueFanout::new(store.clone(), "conveyor"));

        // A single assembling-phase consumer, so the batch stops at the
        // publishing announcement
        let handle = tokio::spawn(consume_phase(
            store.clone() as Arc<dyn JobStore>,
            Arc::new(AlwaysOk),
            fanout,
            config,
            BatchPhase::Assembling,
            0,
            cancel.clone(),
        ));

        // Wait for the consumer to pick up the message and drain the batch
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while store.stage_depth("conveyor.publishing") == 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.pending_count("b1").await.unwrap(), 0);
        assert_eq!(
            store.batch_phase("b1").await.unwrap(),
            BatchPhase::Publishing
        );
        // The announcement moved to the next phase's queue and the handled
        // message was archived
        assert_eq!(store.stage_depth("conveyor.assembling"), 0);
        assert_eq!(store.stage_depth("conveyor.publishing"), 1);
    }

    #[tokio::test]
    async fn test_spawn_consumers_task_count() {
        let store = Arc::new(InMemoryJobStore::new());
        let config = ServerConfig {
            total_shards: Some(3),
            ..fast_config()
        };
        let cancel = CancellationToken::new();
        let fanout: Arc<dyn FanoutTrigger> =
            Arc::new(PhaseQueueFanout::new(store.clone(), "conveyor"));

        let handles = spawn_consumers(
            store.clone(),
            Arc::new(AlwaysOk),
            fanout,
            &config,
            cancel.clone(),
        );

        // Two runnable phases x three shards, plus the done-queue drainer
        assert_eq!(handles.len(), 7);
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
