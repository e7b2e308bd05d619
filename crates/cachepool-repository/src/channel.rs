//! Replica I/O channels
//!
//! A channel is the handle a mover uses to read or write one replica's
//! bytes. [`FileChannel`] is the plain file-backed implementation; other
//! channels wrap it to add accounting.

use cachepool_common::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Random-access I/O over a single replica
pub trait RepositoryChannel: Send {
    /// Read into `buf` starting at `offset`, returns bytes read
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` starting at `offset`
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Write all of `buf` at the current position and advance it
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Current position used by [`RepositoryChannel::write`]
    fn position(&self) -> u64;

    /// Set the file length, growing or shrinking it
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Current file length
    fn size(&self) -> Result<u64>;

    /// Flush data to stable storage
    fn sync(&mut self) -> Result<()>;

    /// Release the channel; further I/O fails
    fn close(&mut self) -> Result<()>;
}

/// Channel over a regular file
pub struct FileChannel {
    file: File,
    path: PathBuf,
    position: u64,
    closed: bool,
}

impl FileChannel {
    /// Wrap an open file
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
            position: 0,
            closed: false,
        }
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Storage(format!(
                "channel for {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl RepositoryChannel for FileChannel {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
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
        self.file.set_len(size)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.file.flush()?;
            self.closed = true;
        }
        Ok(())
    }
}
