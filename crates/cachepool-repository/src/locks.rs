//! Per-identifier mutual exclusion
//!
//! Reconciling or removing a replica must not interleave with another
//! operation on the same identifier. Entries are created on demand and
//! dropped again once nobody holds or waits on them.
//!
//! [`OpenChannels`] tracks replicas that have a write channel outstanding.
//! Such a replica owns its space reservation until the channel closes.

use cachepool_common::FileId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct IdLocks {
    locks: DashMap<FileId, Arc<Mutex<()>>>,
}

impl IdLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`
    pub async fn lock(&self, id: &FileId) -> IdGuard<'_> {
        let mutex = self.locks.entry(id.clone()).or_default().value().clone();
        let guard = mutex.lock_owned().await;
        IdGuard {
            locks: self,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    /// Number of identifiers currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Holds the lock for one identifier until dropped
pub struct IdGuard<'a> {
    locks: &'a IdLocks,
    id: FileId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left means no holder and no waiter
        self.locks
            .locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Replicas with an allocator-aware channel still open
#[derive(Debug, Default, Clone)]
pub struct OpenChannels {
    open: Arc<DashMap<FileId, ()>>,
}

impl OpenChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` open until the returned lease is dropped
    pub fn open(&self, id: &FileId) -> ChannelLease {
        self.open.insert(id.clone(), ());
        ChannelLease {
            open: self.open.clone(),
            id: id.clone(),
        }
    }

    pub fn is_open(&self, id: &FileId) -> bool {
        self.open.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

/// Keeps one identifier registered in [`OpenChannels`]
#[derive(Debug)]
pub struct ChannelLease {
    open: Arc<DashMap<FileId, ()>>,
    id: FileId,
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.open.remove(&self.id);
    }
}
