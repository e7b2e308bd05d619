//! Replica data files on local disk
//!
//! Every replica is one regular file named after its identifier inside
//! the pool's data directory. Absence is reported as a value, never as
//! an error.

use crate::channel::FileChannel;
use cachepool_common::{Error, FileId, Result};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Access mode for opening a replica
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only
    Read,
    /// Read and write, the file must already exist
    ReadWrite,
}

/// Local storage of replica bytes
pub trait FileStore: Send + Sync {
    /// Check whether a data file exists
    fn exists(&self, id: &FileId) -> Result<bool>;

    /// Size of the data file, `None` if it does not exist
    fn size(&self, id: &FileId) -> Result<Option<u64>>;

    /// Create an empty data file and open it for writing
    fn create(&self, id: &FileId) -> Result<FileChannel>;

    /// Open an existing data file
    fn open(&self, id: &FileId, mode: OpenMode) -> Result<FileChannel>;

    /// Delete a data file, returns whether it existed
    fn delete(&self, id: &FileId) -> Result<bool>;

    /// Identifiers of all data files
    fn index(&self) -> Result<Vec<FileId>>;
}

/// File store backed by a directory with one file per replica
pub struct DirectoryFileStore {
    dir: PathBuf,
}

impl DirectoryFileStore {
    /// Open the store, creating the directory if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::Storage(format!("failed to create data dir {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    /// Path of the data file for an identifier
    pub fn path(&self, id: &FileId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    /// Data directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FileStore for DirectoryFileStore {
    fn exists(&self, id: &FileId) -> Result<bool> {
        Ok(self.size(id)?.is_some())
    }

    fn size(&self, id: &FileId) -> Result<Option<u64>> {
        match fs::metadata(self.path(id)) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Err(Error::Storage(format!(
                "{} is not a regular file",
                self.path(id).display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::DiskIo(e)),
        }
    }

    fn create(&self, id: &FileId) -> Result<FileChannel> {
        let path = self.path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {}: {}", path.display(), e)))?;
        debug!("Created data file for {}", id);
        Ok(FileChannel::new(file, path))
    }

    fn open(&self, id: &FileId, mode: OpenMode) -> Result<FileChannel> {
        let path = self.path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(&path)?;
        Ok(FileChannel::new(file, path))
    }

    fn delete(&self, id: &FileId) -> Result<bool> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => {
                debug!("Deleted data file for {}", id);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::DiskIo(e)),
        }
    }

    fn index(&self) -> Result<Vec<FileId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match FileId::new(name.to_string()) {
                Ok(id) if entry.file_type()?.is_file() => ids.push(id),
                Ok(_) => {}
                Err(e) => warn!("Ignoring unexpected entry {:?} in data dir: {}", name, e),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
