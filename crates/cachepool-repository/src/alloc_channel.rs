//! Channel wrapper that keeps space reservations in step with file growth
//!
//! Space is reserved ahead of writes in fixed increments. On close the
//! reservation is trimmed or topped up so it matches the persisted size
//! exactly.

use crate::allocator::Allocator;
use crate::channel::RepositoryChannel;
use crate::locks::ChannelLease;
use cachepool_common::{Error, FileId, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// A [`RepositoryChannel`] that reserves pool space before it writes
pub struct AllocatorAwareChannel<C: RepositoryChannel> {
    inner: C,
    allocator: Arc<dyn Allocator>,
    id: FileId,
    increment: u64,
    allocated: u64,
    closed: bool,
    lease: Option<ChannelLease>,
}

impl<C: RepositoryChannel> AllocatorAwareChannel<C> {
    /// Wrap a channel for a replica that has nothing reserved yet
    pub fn new(
        inner: C,
        allocator: Arc<dyn Allocator>,
        id: FileId,
        increment: u64,
    ) -> Result<Self> {
        Self::with_allocated(inner, allocator, id, increment, 0)
    }

    /// Wrap a channel for a replica that already holds `allocated` bytes
    pub fn with_allocated(
        inner: C,
        allocator: Arc<dyn Allocator>,
        id: FileId,
        increment: u64,
        allocated: u64,
    ) -> Result<Self> {
        if increment == 0 {
            return Err(Error::invalid_argument(
                "allocation increment must be positive",
            ));
        }
        Ok(Self {
            inner,
            allocator,
            id,
            increment,
            allocated,
            closed: false,
            lease: None,
        })
    }

    /// Hold `lease` until the reservation has been settled
    #[must_use]
    pub fn with_lease(mut self, lease: ChannelLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Replica this channel writes
    pub fn id(&self) -> &FileId {
        &self.id
    }

    /// Bytes currently reserved through this channel
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Reserve increments until `len` bytes starting at `offset` are covered
    fn preallocate_range(&mut self, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64).ok_or_else(|| {
            Error::invalid_argument(format!(
                "write of {} bytes at offset {} overflows {}",
                len, offset, self.id
            ))
        })?;
        self.preallocate(end)
    }

    /// Reserve increments until `position` is covered
    fn preallocate(&mut self, position: u64) -> Result<()> {
        while position > self.allocated {
            self.allocator.allocate(&self.id, self.increment)?;
            self.allocated += self.increment;
        }
        Ok(())
    }

    /// Make the reservation equal the inner channel's size
    fn settle(&mut self) -> Result<()> {
        let size = self.inner.size()?;

        if self.allocated > size {
            self.allocator.free(&self.id, self.allocated - size)?;
            self.allocated = size;
        } else if self.allocated < size {
            while self.allocated + self.increment <= size {
                self.allocator.allocate(&self.id, self.increment)?;
                self.allocated += self.increment;
            }
            let remainder = size - self.allocated;
            if remainder > 0 {
                self.allocator.allocate(&self.id, remainder)?;
                self.allocated = size;
            }
        }

        debug!("Settled {} at {} bytes", self.id, size);
        Ok(())
    }
}

impl<C: RepositoryChannel> RepositoryChannel for AllocatorAwareChannel<C> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.preallocate_range(offset, buf.len())?;
        self.inner.write_at(offset, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.preallocate_range(self.inner.position(), buf.len())?;
        self.inner.write(buf)
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.preallocate(size)?;
        self.inner.truncate(size)
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let settled = self.settle();
        let closed = self.inner.close();
        drop(self.lease.take());
        settled?;
        closed
    }
}

impl<C: RepositoryChannel> Drop for AllocatorAwareChannel<C> {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.close()
        {
            warn!("Failed to settle space for {} on drop: {}", self.id, e);
        }
    }
}
