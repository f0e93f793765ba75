//! Removal of old tombstones from the KV store.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pipemesh_core::unix_timestamp;
use pipemesh_kv::{ConsistentClient, KvError};

use crate::record::PipeRecord;

/// Delete every record under `prefix` tombstoned at least `ttl` before
/// `now`. Live records are never touched. Returns the number deleted.
#[allow(clippy::cast_possible_wrap)]
pub async fn reap_tombstones(
    client: &ConsistentClient,
    prefix: &str,
    ttl: Duration,
    now: i64,
) -> Result<usize, KvError> {
    let cutoff = now - ttl.as_secs() as i64;
    client
        .delete_selected(prefix, |key, record: &PipeRecord| {
            let expired = !record.is_live() && record.deleted_at <= cutoff;
            if expired {
                debug!(key, deleted_at = record.deleted_at, "Reaping tombstone");
            }
            expired
        })
        .await
}

/// Reap tombstones every `interval` until `done` is cancelled.
pub async fn run(
    client: ConsistentClient,
    prefix: String,
    ttl: Duration,
    interval: Duration,
    done: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);
    interval.tick().await; // Skip first immediate tick
    loop {
        tokio::select! {
            biased;
            () = done.cancelled() => return,
            _ = interval.tick() => {}
        }
        match reap_tombstones(&client, &prefix, ttl, unix_timestamp()).await {
            Ok(removed) if removed > 0 => info!(removed, "Tombstone reap completed"),
            Err(e) => warn!(error = %e, "Tombstone reap failed"),
            _ => {}
        }
    }
}
