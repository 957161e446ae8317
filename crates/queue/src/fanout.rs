//! Drain detection and exactly-once phase fan-out
//!
//! There is no persistent scheduler: the worker that drains a batch is the
//! one that moves the pipeline forward. Several workers can observe "drained"
//! near-simultaneously, so the phase transition is a compare-and-swap and
//! only the winner invokes the trigger.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::job::BatchPhase;
use crate::persistence::{JobStore, StoreError};

/// Outbound call into the next pipeline stage
#[async_trait]
pub trait FanoutTrigger: Send + Sync + 'static {
    /// Invoked exactly once per phase transition, by the CAS winner
    async fn phase_complete(&self, batch_id: &str, next: BatchPhase) -> Result<(), StoreError>;
}

/// Default trigger: announce the next phase on a stage queue
pub struct StageFanout {
    store: Arc<dyn JobStore>,
    queue: String,
}

impl StageFanout {
    pub fn new(store: Arc<dyn JobStore>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl FanoutTrigger for StageFanout {
    async fn phase_complete(&self, batch_id: &str, next: BatchPhase) -> Result<(), StoreError> {
        self.store.enqueue_stage(&self.queue, next, batch_id).await?;
        info!(batch_id, %next, queue = %self.queue, "fanned out to next stage");
        Ok(())
    }
}

/// What the invocation decided after its last cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Pending jobs remain; the outer consumer loop should run again
    MoreWork,

    /// This worker won the transition and fired the trigger
    PhaseComplete(BatchPhase),

    /// Another worker won the transition first; nothing to do
    AlreadyAdvanced,

    /// The batch is in its final phase; the pipeline is finished
    PipelineDone,
}

/// Decide whether a batch is drained and, if so, advance it exactly once
///
/// The pending count is re-read immediately before the CAS so a job enqueued
/// or requeued between checks keeps the batch open.
pub async fn finish_drained_batch(
    store: &dyn JobStore,
    trigger: &dyn FanoutTrigger,
    batch_id: &str,
) -> Result<DrainOutcome, StoreError> {
    if store.pending_count(batch_id).await? > 0 {
        return Ok(DrainOutcome::MoreWork);
    }

    let phase = store.batch_phase(batch_id).await?;
    let next = match phase.next() {
        Some(next) => next,
        None => return Ok(DrainOutcome::PipelineDone),
    };

    // Guard the transition: the count must still be zero right before the CAS
    if store.pending_count(batch_id).await? > 0 {
        return Ok(DrainOutcome::MoreWork);
    }

    if store.advance_phase(batch_id, phase, next).await? {
        debug!(batch_id, %phase, %next, "batch drained, advancing phase");
        trigger.phase_complete(batch_id, next).await?;
        Ok(DrainOutcome::PhaseComplete(next))
    } else {
        Ok(DrainOutcome::AlreadyAdvanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPayload;
    use crate::persistence::{InMemoryJobStore, NewJob};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingTrigger {
        fired: AtomicUsize,
    }

    #[async_trait]
    impl FanoutTrigger for CountingTrigger {
        async fn phase_complete(
            &self,
            _batch_id: &str,
            _next: BatchPhase,
        ) -> Result<(), StoreError> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pending_jobs_keep_batch_open() {
        let store = InMemoryJobStore::new();
        store
            .create_batch("b1", BatchPhase::Drafting)
            .await
            .unwrap();
        store
            .enqueue_job(NewJob::new(
                "b1",
                JobPayload::SectionDraft {
                    article_id: Uuid::now_v7(),
                    section_key: "s".to_string(),
                },
            ))
            .await
            .unwrap();

        let trigger = Arc::new(CountingTrigger {
            fired: AtomicUsize::new(0),
        });
        let outcome = finish_drained_batch(&store, trigger.as_ref(), "b1")
            .await
            .unwrap();

        assert_eq!(outcome, DrainOutcome::MoreWork);
        assert_eq!(trigger.fired.load(Ordering::SeqCst), 0);
        assert_eq!(store.batch_phase("b1").await.unwrap(), BatchPhase::Drafting);
    }

    #[tokio::test]
    async fn test_concurrent_observers_fire_once() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .create_batch("b1", BatchPhase::Drafting)
            .await
            .unwrap();

        let trigger = Arc::new(CountingTrigger {
            fired: AtomicUsize::new(0),
        });

        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = Arc::clone(&store);
            let trigger = Arc::clone(&trigger);
            handles.push(tokio::spawn(async move {
                finish_drained_batch(store.as_ref(), trigger.as_ref(), "b1")
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), DrainOutcome::PhaseComplete(_)) {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(trigger.fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.batch_phase("b1").await.unwrap(),
            BatchPhase::Assembling
        );
    }

    #[tokio::test]
    async fn test_final_phase_reports_done() {
        let store = InMemoryJobStore::new();
        store.create_batch("b1", BatchPhase::Done).await.unwrap();

        let trigger = Arc::new(CountingTrigger {
            fired: AtomicUsize::new(0),
        });
        let outcome = finish_drained_batch(&store, trigger.as_ref(), "b1")
            .await
            .unwrap();

        assert_eq!(outcome, DrainOutcome::PipelineDone);
        assert_eq!(trigger.fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stage_fanout_enqueues_message() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .create_batch("b1", BatchPhase::Drafting)
            .await
            .unwrap();

        let fanout = StageFanout::new(store.clone(), "pipeline");
        let outcome = finish_drained_batch(store.as_ref(), &fanout, "b1")
            .await
            .unwrap();

        assert_eq!(outcome, DrainOutcome::PhaseComplete(BatchPhase::Assembling));
        assert_eq!(store.stage_depth("pipeline"), 1);
    }
}
