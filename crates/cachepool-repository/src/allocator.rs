//! Pool space accounting
//!
//! The allocator tracks how many bytes are reserved for every replica
//! against the pool's capacity. It is shared by all concurrently active
//! channels and by the reconciler, so all bookkeeping happens under one
//! lock.

use cachepool_common::{Error, FileId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

/// Per-replica space reservation
pub trait Allocator: Send + Sync {
    /// Reserve `bytes` more for `id`
    fn allocate(&self, id: &FileId, bytes: u64) -> Result<()>;

    /// Release `bytes` previously reserved for `id`
    fn free(&self, id: &FileId, bytes: u64) -> Result<()>;

    /// Bytes currently reserved for `id`
    fn reserved(&self, id: &FileId) -> u64;
}

/// Release everything reserved for `id`, returns the bytes freed
pub fn release(allocator: &dyn Allocator, id: &FileId) -> Result<u64> {
    let reserved = allocator.reserved(id);
    if reserved > 0 {
        allocator.free(id, reserved)?;
    }
    Ok(reserved)
}

/// Adjust the reservation for `id` to exactly `size` bytes
pub fn sync_reservation(allocator: &dyn Allocator, id: &FileId, size: u64) -> Result<()> {
    let reserved = allocator.reserved(id);
    if size > reserved {
        allocator.allocate(id, size - reserved)
    } else if size < reserved {
        allocator.free(id, reserved - size)
    } else {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AllocState {
    used: u64,
    reserved: HashMap<FileId, u64>,
}

/// Capacity-bounded allocator for one pool
pub struct PoolAllocator {
    capacity: u64,
    state: Mutex<AllocState>,
}

impl PoolAllocator {
    /// Create an allocator with the given capacity in bytes
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(AllocState::default()),
        }
    }

    /// Total capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes reserved across all replicas
    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    /// Bytes still available
    pub fn free_space(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }

    /// Number of replicas holding a reservation
    pub fn replica_count(&self) -> usize {
        self.state.lock().reserved.len()
    }
}

impl Allocator for PoolAllocator {
    fn allocate(&self, id: &FileId, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }

        let mut state = self.state.lock();
        let available = self.capacity.saturating_sub(state.used);
        if bytes > available {
            return Err(Error::InsufficientSpace {
                required: bytes,
                available,
            });
        }

        state.used += bytes;
        *state.reserved.entry(id.clone()).or_insert(0) += bytes;
        trace!("allocate: {} +{} (used {})", id, bytes, state.used);
        Ok(())
    }

    fn free(&self, id: &FileId, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }

        let mut state = self.state.lock();
        let reserved = state.reserved.get(id).copied().unwrap_or(0);
        if bytes > reserved {
            return Err(Error::AllocatorUnderflow {
                id: id.clone(),
                requested: bytes,
                reserved,
            });
        }

        if bytes == reserved {
            state.reserved.remove(id);
        } else {
            state.reserved.insert(id.clone(), reserved - bytes);
        }
        state.used -= bytes;
        trace!("free: {} -{} (used {})", id, bytes, state.used);
        Ok(())
    }

    fn reserved(&self, id: &FileId) -> u64 {
        self.state.lock().reserved.get(id).copied().unwrap_or(0)
    }
}

impl std::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PoolAllocator")
            .field("capacity", &self.capacity)
            .field("used", &state.used)
            .field("replicas", &state.reserved.len())
            .finish()
    }
}
