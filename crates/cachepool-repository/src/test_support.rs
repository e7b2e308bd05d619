//! Test doubles shared by the unit tests in this crate

use crate::allocator::{Allocator, PoolAllocator};
use crate::channel::RepositoryChannel;
use cachepool_common::{Error, FileId, Result};
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocOp {
    Allocate(FileId, u64),
    Free(FileId, u64),
}

/// Unbounded allocator that remembers every call in order
pub struct RecordingAllocator {
    inner: PoolAllocator,
    ops: Mutex<Vec<AllocOp>>,
}

impl RecordingAllocator {
    pub fn new() -> Self {
        Self {
            inner: PoolAllocator::new(u64::MAX),
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn ops(&self) -> Vec<AllocOp> {
        self.ops.lock().clone()
    }
}

impl Allocator for RecordingAllocator {
    fn allocate(&self, id: &FileId, bytes: u64) -> Result<()> {
        self.ops.lock().push(AllocOp::Allocate(id.clone(), bytes));
        self.inner.allocate(id, bytes)
    }

    fn free(&self, id: &FileId, bytes: u64) -> Result<()> {
        self.ops.lock().push(AllocOp::Free(id.clone(), bytes));
        self.inner.free(id, bytes)
    }

    fn reserved(&self, id: &FileId) -> u64 {
        self.inner.reserved(id)
    }
}

/// Channel that tracks only a length, the bytes themselves are dropped
#[derive(Default)]
pub struct MockChannel {
    pub len: u64,
    position: u64,
    closed: bool,
}

impl MockChannel {
    pub fn with_len(len: u64) -> Self {
        Self {
            len,
            ..Self::default()
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Storage("closed".into()));
        }
        Ok(())
    }
}

impl RepositoryChannel for MockChannel {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let available = self.len.saturating_sub(offset).min(buf.len() as u64) as usize;
        buf[..available].fill(0);
        Ok(available)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        self.len = self.len.max(offset + buf.len() as u64);
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let written = self.write_at(self.position, buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_open()?;
        self.len = size;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.len)
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
