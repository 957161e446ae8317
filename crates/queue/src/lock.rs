//! Lease acquisition over candidate sets
//!
//! The manager turns a hinted candidate page into held leases. Every id is
//! re-validated by the store's conditional update, so stale hints and lost
//! races cost one failed attempt each and nothing else.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::persistence::{JobStore, LockedJob, StoreError};

/// Acquires, releases, and reclaims time-bounded leases on job rows
pub struct LockManager {
    store: Arc<dyn JobStore>,
    lease: Duration,
}

impl LockManager {
    /// Create a lock manager issuing leases of the given duration
    pub fn new(store: Arc<dyn JobStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    /// The lease duration stamped on acquired jobs
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Attempt to lock each candidate; return the ones this worker won
    ///
    /// A candidate lost to a racing worker is skipped silently. An empty
    /// candidate set returns empty with no side effects.
    pub async fn acquire(
        &self,
        worker_token: &str,
        candidates: &[Uuid],
    ) -> Result<Vec<LockedJob>, StoreError> {
        let mut locked = Vec::new();

        for &job_id in candidates {
            match self.store.try_lock(job_id, worker_token, self.lease).await? {
                Some(job) => locked.push(job),
                None => trace!(%job_id, "lost acquisition race, skipping"),
            }
        }

        if !locked.is_empty() {
            debug!(worker_token, count = locked.len(), "acquired jobs");
        }
        Ok(locked)
    }

    /// Release a held lease so any worker can re-acquire the job
    pub async fn release(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.store.release_lock(job_id).await
    }

    /// Reclaim every expired lease, optionally scoped to one batch
    pub async fn sweep_expired(&self, batch_id: Option<&str>) -> Result<u64, StoreError> {
        self.store.sweep_expired(batch_id).await
    }
}
