use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::GatewayResult;
use crate::store::{ObjectDescriptor, ObjectStore, PartitionId, StoreSession};

type SessionSlot = Arc<OnceCell<Arc<dyn StoreSession>>>;

// ---------------------------------------------------------------------------
// Partition session cache
// ---------------------------------------------------------------------------

/// Fetches single chunks through partition sessions that are created on first
/// use and then shared by every stream, whichever pool entry it runs on.
///
/// Concurrent first fetches against the same partition wait on the same
/// handshake instead of racing to open their own session.
#[derive(Default)]
pub struct ChunkFetcher {
    sessions: Mutex<HashMap<PartitionId, SessionSlot>>,
}

impl ChunkFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached session for `partition`, establishing it through
    /// `store` if this is the first request for that partition. A failed
    /// handshake leaves the slot empty so the next request retries.
    pub async fn session_for(
        &self,
        store: &dyn ObjectStore,
        partition: &PartitionId,
    ) -> GatewayResult<Arc<dyn StoreSession>> {
        let slot = {
            let mut map = self.sessions.lock();
            map.entry(partition.clone()).or_default().clone()
        };
        let session = slot
            .get_or_try_init(|| async {
                let t0 = Instant::now();
                let result = store.establish_session(partition).await;
                match &result {
                    Ok(_) => info!(
                        partition = %partition,
                        elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0,
                        "partition session cached"
                    ),
                    Err(e) => warn!(partition = %partition, "session handshake failed: {e}"),
                }
                result
            })
            .await?;
        Ok(session.clone())
    }

    /// Up to `limit` bytes of `object` starting at `offset`. Short results
    /// signal end of object and are passed through untouched.
    pub async fn fetch(
        &self,
        store: &dyn ObjectStore,
        object: &ObjectDescriptor,
        partition: &PartitionId,
        offset: u64,
        limit: u64,
    ) -> GatewayResult<Bytes> {
        let session = self.session_for(store, partition).await?;
        session.fetch_chunk(object, offset, limit).await
    }

    /// Partitions with an established session.
    pub fn cached_sessions(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}

impl std::fmt::Debug for ChunkFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkFetcher")
            .field("cached_sessions", &self.cached_sessions())
            .finish()
    }
}
