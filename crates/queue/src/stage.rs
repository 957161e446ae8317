//! Stage queue consumer
//!
//! The stage queue sequences whole pipeline phases with a coarser primitive
//! than the job queue: at most one message per dequeue, leased by the store
//! itself, physically removed once handled. A message whose declared stage is
//! not what the consumer expects is archived without processing, draining it
//! instead of letting a poison message loop forever.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::job::BatchPhase;
use crate::persistence::{JobStore, StageMessage, StoreError};

/// What one stage poll produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagePoll {
    /// No visible message on the queue
    Empty,

    /// Message handled and archived
    Handled { message_id: Uuid },

    /// Message declared an unexpected stage and was drained unprocessed
    Mismatched {
        message_id: Uuid,
        stage: BatchPhase,
    },

    /// Handler failed; the message stays leased and reappears after the
    /// visibility timeout lapses
    HandlerFailed { message_id: Uuid, error: String },
}

/// Consumes one stage queue, expecting messages for a single phase
pub struct StageConsumer {
    store: Arc<dyn JobStore>,
    queue: String,
    expected: BatchPhase,
    visibility: Duration,
}

impl StageConsumer {
    /// Create a consumer for `queue` that handles `expected`-phase messages
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: impl Into<String>,
        expected: BatchPhase,
        visibility: Duration,
    ) -> Self {
        Self {
            store,
            queue: queue.into(),
            expected,
            visibility,
        }
    }

    /// Dequeue at most one message and run `handler` on it
    pub async fn poll<H, Fut>(&self, handler: H) -> Result<StagePoll, StoreError>
    where
        H: FnOnce(StageMessage) -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let message = match self.store.dequeue_stage(&self.queue, self.visibility).await? {
            Some(m) => m,
            None => return Ok(StagePoll::Empty),
        };

        if message.stage != self.expected {
            warn!(
                message_id = %message.id,
                stage = %message.stage,
                expected = %self.expected,
                "stage mismatch, draining message"
            );
            self.store.archive_stage(&self.queue, message.id).await?;
            return Ok(StagePoll::Mismatched {
                message_id: message.id,
                stage: message.stage,
            });
        }

        let message_id = message.id;
        match handler(message).await {
            Ok(()) => {
                self.store.archive_stage(&self.queue, message_id).await?;
                debug!(%message_id, "stage message handled");
                Ok(StagePoll::Handled { message_id })
            }
            Err(error) => {
                warn!(%message_id, %error, "stage handler failed, message will reappear");
                Ok(StagePoll::HandlerFailed { message_id, error })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryJobStore;

    fn consumer(store: Arc<InMemoryJobStore>, expected: BatchPhase) -> StageConsumer {
        StageConsumer::new(store, "pipeline", expected, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let store = Arc::new(InMemoryJobStore::new());
        let consumer = consumer(store, BatchPhase::Assembling);

        let poll = consumer.poll(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(poll, StagePoll::Empty);
    }

    #[tokio::test]
    async fn test_matching_message_handled_and_archived() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .enqueue_stage("pipeline", BatchPhase::Assembling, "b1")
            .await
            .unwrap();

        let consumer = consumer(store.clone(), BatchPhase::Assembling);
        let poll = consumer
            .poll(|message| async move {
                assert_eq!(message.batch_id, "b1");
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(poll, StagePoll::Handled { .. }));
        assert_eq!(store.stage_depth("pipeline"), 0);
    }

    #[tokio::test]
    async fn test_mismatched_message_drained_without_processing() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .enqueue_stage("pipeline", BatchPhase::Publishing, "b1")
            .await
            .unwrap();

        let consumer = consumer(store.clone(), BatchPhase::Assembling);
        let poll = consumer
            .poll(|_| async {
                panic!("mismatched message must not reach the handler");
            })
            .await
            .unwrap();

        assert!(matches!(
            poll,
            StagePoll::Mismatched {
                stage: BatchPhase::Publishing,
                ..
            }
        ));
        assert_eq!(store.stage_depth("pipeline"), 0);
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_message_for_retry() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .enqueue_stage("pipeline", BatchPhase::Assembling, "b1")
            .await
            .unwrap();

        let consumer = consumer(store.clone(), BatchPhase::Assembling);
        let poll = consumer
            .poll(|_| async { Err("downstream unavailable".to_string()) })
            .await
            .unwrap();
        assert!(matches!(poll, StagePoll::HandlerFailed { .. }));
        assert_eq!(store.stage_depth("pipeline"), 1);

        // Invisible while leased, visible again after the timeout
        let poll = consumer.poll(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(poll, StagePoll::Empty);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let poll = consumer.poll(|_| async { Ok(()) }).await.unwrap();
        assert!(matches!(poll, StagePoll::Handled { .. }));
    }
}
