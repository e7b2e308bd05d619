//! Replica metadata store contract and in-memory implementation

use cachepool_common::{Error, FileId, ReplicaRecord, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Durable identifier → record mapping
pub trait ReplicaStore: Send + Sync {
    /// Insert a new record, fails with `DuplicateReplica` if one exists
    fn create(&self, record: &ReplicaRecord) -> Result<()>;

    /// Look up a record
    fn get(&self, id: &FileId) -> Result<Option<ReplicaRecord>>;

    /// Replace an existing record
    fn update(&self, record: &ReplicaRecord) -> Result<()>;

    /// Remove a record, returns whether it existed
    fn delete(&self, id: &FileId) -> Result<bool>;

    /// Identifiers of all records, sorted
    fn index(&self) -> Result<Vec<FileId>>;
}

/// Record store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryReplicaStore {
    records: RwLock<BTreeMap<FileId, ReplicaRecord>>,
}

impl MemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl ReplicaStore for MemoryReplicaStore {
    fn create(&self, record: &ReplicaRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(Error::DuplicateReplica(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, id: &FileId) -> Result<Option<ReplicaRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn update(&self, record: &ReplicaRecord) -> Result<()> {
        let mut records = self.records.write();
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(Error::metadata(format!("no record for {}", record.id))),
        }
    }

    fn delete(&self, id: &FileId) -> Result<bool> {
        Ok(self.records.write().remove(id).is_some())
    }

    fn index(&self) -> Result<Vec<FileId>> {
        Ok(self.records.read().keys().cloned().collect())
    }
}
