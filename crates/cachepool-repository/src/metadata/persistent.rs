//! Persistent replica metadata backed by redb.
//!
//! One record per identifier, bincode-encoded. Every mutation is its own
//! write transaction, so a record is either fully updated or untouched.

use super::store::ReplicaStore;
use super::tables;
use cachepool_common::{Error, FileId, ReplicaRecord, Result};
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::{error, info};

/// Error type for replica store operations
#[derive(Debug, thiserror::Error)]
pub enum ReplicaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for ReplicaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<ReplicaStoreError> for Error {
    fn from(e: ReplicaStoreError) -> Self {
        Self::Metadata(e.to_string())
    }
}

pub type ReplicaStoreResult<T> = std::result::Result<T, ReplicaStoreError>;

/// Replica store persisted in a redb database file
pub struct RedbReplicaStore {
    db: Database,
}

impl RedbReplicaStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> ReplicaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so read txns don't fail on a fresh file
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::REPLICAS)?;
        }
        write_txn.commit()?;

        info!("Opened replica metadata at {}", path.display());
        Ok(Self { db })
    }

    /// Insert or replace, `must_exist` decides which of the two is allowed.
    /// Returns false without committing when the precondition fails.
    fn write_record(&self, record: &ReplicaRecord, must_exist: bool) -> ReplicaStoreResult<bool> {
        let bytes = bincode::serialize(record)?;
        let key = record.id.as_str();

        let write_txn = self.db.begin_write()?;
        let written = {
            let mut table = write_txn.open_table(tables::REPLICAS)?;
            let exists = table.get(key)?.is_some();
            if exists == must_exist {
                table.insert(key, bytes.as_slice())?;
                true
            } else {
                false
            }
        };
        if written {
            write_txn.commit()?;
        }
        Ok(written)
    }

    fn read_record(&self, id: &FileId) -> ReplicaStoreResult<Option<ReplicaRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::REPLICAS)?;
        match table.get(id.as_str())? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    fn delete_record(&self, id: &FileId) -> ReplicaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(tables::REPLICAS)?;
            table.remove(id.as_str())?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn load_keys(&self) -> ReplicaStoreResult<Vec<FileId>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::REPLICAS)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            match FileId::new(key) {
                Ok(id) => ids.push(id),
                Err(e) => error!("Skipping invalid replica key '{}': {}", key, e),
            }
        }
        Ok(ids)
    }
}

impl ReplicaStore for RedbReplicaStore {
    fn create(&self, record: &ReplicaRecord) -> Result<()> {
        if self.write_record(record, false)? {
            Ok(())
        } else {
            Err(Error::DuplicateReplica(record.id.clone()))
        }
    }

    fn get(&self, id: &FileId) -> Result<Option<ReplicaRecord>> {
        Ok(self.read_record(id)?)
    }

    fn update(&self, record: &ReplicaRecord) -> Result<()> {
        if self.write_record(record, true)? {
            Ok(())
        } else {
            Err(Error::metadata(format!("no record for {}", record.id)))
        }
    }

    fn delete(&self, id: &FileId) -> Result<bool> {
        Ok(self.delete_record(id)?)
    }

    fn index(&self) -> Result<Vec<FileId>> {
        // redb iterates keys in order
        Ok(self.load_keys()?)
    }
}
