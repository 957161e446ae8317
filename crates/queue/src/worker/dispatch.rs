//! Processing collaborator seam

use async_trait::async_trait;

use crate::persistence::{LockedJob, NewJob};

/// Result of dispatching one job to the processing collaborator
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The collaborator reported success
    Success,

    /// Transient failure; enters the retry policy
    Failure(String),

    /// The job's input does not exist yet; not a retryable error
    ///
    /// The worker enqueues `dependency` on its own queue and releases the
    /// original job without touching its retry counter, so it is attempted
    /// again once the dependency has run.
    MissingPrerequisite { dependency: NewJob },
}

/// The business-logic collaborator workers dispatch jobs to
///
/// Implementations are invoked concurrently, once per acquired job, each call
/// bounded by the worker's dispatch timeout. A call that outlives its timeout
/// is cancelled client-side but may still finish remotely; the store's fenced
/// completion makes such late results harmless.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: &LockedJob) -> ProcessOutcome;
}
