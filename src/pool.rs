//! Load-balanced pool of store clients.
//!
//! Every entry carries a workload counter: the number of streams currently
//! pinned to it. New streams go to the least-loaded entry, ties broken by the
//! lowest id. Workload is held through a [`WorkloadGuard`], which releases it
//! exactly once when dropped, whether the stream finished, failed or the
//! client went away mid-body.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};

pub type ClientId = u32;

struct PoolEntry<S: ?Sized> {
    handle: Arc<S>,
    workload: u64,
}

pub struct SessionPool<S: ?Sized> {
    entries: Mutex<BTreeMap<ClientId, PoolEntry<S>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkloadSnapshot {
    pub id: ClientId,
    pub workload: u64,
}

impl<S: ?Sized> Default for SessionPool<S> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<S: ?Sized> SessionPool<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client with zero workload.
    pub fn register(&self, id: ClientId, handle: Arc<S>) -> GatewayResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(GatewayError::DuplicateSession(id));
        }
        entries.insert(id, PoolEntry { handle, workload: 0 });
        Ok(())
    }

    /// Least-loaded client; the lowest id wins a tie.
    pub fn select(&self) -> GatewayResult<(ClientId, Arc<S>)> {
        let entries = self.entries.lock();
        least_loaded(&entries)
            .map(|(id, entry)| (id, entry.handle.clone()))
            .ok_or(GatewayError::NoSessionAvailable)
    }

    pub fn acquire(&self, id: ClientId) -> GatewayResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or(GatewayError::NoSessionAvailable)?;
        entry.workload += 1;
        Ok(())
    }

    pub fn release(&self, id: ClientId) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if entry.workload > 0 => entry.workload -= 1,
            Some(_) => warn!(client = id, "release without matching acquire"),
            None => warn!(client = id, "release for unknown client"),
        }
    }

    pub fn workload(&self, id: ClientId) -> Option<u64> {
        self.entries.lock().get(&id).map(|e| e.workload)
    }

    pub fn snapshot(&self) -> Vec<WorkloadSnapshot> {
        self.entries
            .lock()
            .iter()
            .map(|(&id, e)| WorkloadSnapshot {
                id,
                workload: e.workload,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Select and acquire under one lock, so a burst of requests spreads
    /// across the pool instead of piling onto the same entry.
    pub fn checkout(self: &Arc<Self>) -> GatewayResult<WorkloadGuard<S>> {
        let (id, handle) = {
            let mut entries = self.entries.lock();
            let id = least_loaded(&entries)
                .map(|(id, _)| id)
                .ok_or(GatewayError::NoSessionAvailable)?;
            let entry = entries
                .get_mut(&id)
                .ok_or(GatewayError::NoSessionAvailable)?;
            entry.workload += 1;
            (id, entry.handle.clone())
        };
        debug!(client = id, "workload acquired");
        Ok(WorkloadGuard {
            pool: self.clone(),
            id,
            handle,
        })
    }
}

fn least_loaded<S: ?Sized>(
    entries: &BTreeMap<ClientId, PoolEntry<S>>,
) -> Option<(ClientId, &PoolEntry<S>)> {
    // BTreeMap iterates in id order and min_by_key keeps the first minimum.
    entries
        .iter()
        .min_by_key(|(_, e)| e.workload)
        .map(|(&id, e)| (id, e))
}

/// Holds one unit of workload on a pool entry until dropped.
pub struct WorkloadGuard<S: ?Sized> {
    pool: Arc<SessionPool<S>>,
    id: ClientId,
    handle: Arc<S>,
}

impl<S: ?Sized> WorkloadGuard<S> {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn handle(&self) -> &Arc<S> {
        &self.handle
    }
}

impl<S: ?Sized> Drop for WorkloadGuard<S> {
    fn drop(&mut self) {
        self.pool.release(self.id);
        debug!(client = self.id, "workload released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(workloads: &[u64]) -> Arc<SessionPool<str>> {
        let pool = Arc::new(SessionPool::new());
        for (id, &load) in workloads.iter().enumerate() {
            pool.register(id as ClientId, Arc::from(format!("client-{id}").as_str()))
                .unwrap();
            for _ in 0..load {
                pool.acquire(id as ClientId).unwrap();
            }
        }
        pool
    }

    #[test]
    fn select_prefers_lowest_id_among_least_loaded() {
        let pool = pool_with(&[3, 1, 1, 5]);
        let (id, handle) = pool.select().unwrap();
        assert_eq!(id, 1);
        assert_eq!(&*handle, "client-1");
    }

    #[test]
    fn empty_pool_has_no_session() {
        let pool: SessionPool<str> = SessionPool::new();
        assert!(matches!(pool.select(), Err(GatewayError::NoSessionAvailable)));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let pool = pool_with(&[0]);
        let err = pool.register(0, Arc::from("again")).unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateSession(0)));
    }

    #[test]
    fn guard_releases_exactly_once() {
        let pool = pool_with(&[1, 0]);
        let guard = pool.checkout().unwrap();
        assert_eq!(guard.id(), 1);
        assert_eq!(&**guard.handle(), "client-1");
        assert_eq!(pool.workload(1), Some(1));
        drop(guard);
        assert_eq!(pool.workload(1), Some(0));
        assert_eq!(pool.workload(0), Some(1));
    }

    #[test]
    fn release_never_goes_negative() {
        let pool = pool_with(&[0]);
        pool.release(0);
        assert_eq!(pool.workload(0), Some(0));
    }

    #[test]
    fn checkout_spreads_concurrent_streams() {
        let pool = pool_with(&[0, 0, 0]);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        let c = pool.checkout().unwrap();
        let mut ids = vec![a.id(), b.id(), c.id()];
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        drop((a, b, c));
        assert!(pool.snapshot().iter().all(|s| s.workload == 0));
    }

    #[test]
    fn counters_survive_parallel_acquire_release() {
        let pool = pool_with(&[0, 0]);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let guard = pool.checkout().unwrap();
                        drop(guard);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(pool.workload(0), Some(0));
        assert_eq!(pool.workload(1), Some(0));
    }
}
