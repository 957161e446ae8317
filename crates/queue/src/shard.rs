//! Advisory sharding and contention-spreading candidate selection
//!
//! Shards bias which rows a worker looks at; they are not partitions. The
//! lock manager's conditional update remains the sole correctness guarantee,
//! so a mis-sharded worker is merely inefficient, never incorrect.

use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::persistence::{JobStore, StoreError};

/// Deterministically map a worker identity to a shard in `[0, total_shards)`
///
/// Stable across processes and restarts so the same worker id always sweeps
/// the same advisory scope.
pub fn shard_of(worker_id: &str, total_shards: u32) -> u32 {
    if total_shards <= 1 {
        return 0;
    }

    let digest = Sha256::digest(worker_id.as_bytes());
    let prefix = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    (prefix % total_shards as u64) as u32
}

/// Read a shuffled page of candidate ids starting at a random offset
///
/// Naive oldest-first selection makes every concurrent worker race the same
/// head-of-queue rows. Starting the page at a random offset within the
/// available-row count and shuffling it spreads concurrent lock attempts
/// statistically instead.
pub async fn select_candidates(
    store: &dyn JobStore,
    batch_id: Option<&str>,
    page_size: usize,
) -> Result<Vec<Uuid>, StoreError> {
    let available = store.available_count(batch_id).await?;
    if available == 0 {
        return Ok(vec![]);
    }

    let max_offset = available.saturating_sub(page_size as u64);
    let offset = if max_offset == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_offset)
    };

    let mut candidates = store.fetch_candidates(batch_id, offset, page_size).await?;
    candidates.shuffle(&mut rand::thread_rng());
    Ok(candidates)
}
