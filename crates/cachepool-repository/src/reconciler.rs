//! Replica consistency reconciliation
//!
//! Three sources can disagree about a replica: the bytes on disk, the
//! local [`ReplicaRecord`], and the namespace. [`ConsistencyReconciler::get`]
//! resolves them into one trustworthy record or discards the replica.
//!
//! Trust rules:
//! - A stable record whose size matches the disk is returned without
//!   contacting the namespace.
//! - The namespace is written only once disk content is known to be
//!   complete: a confirmed upload, a repaired broken replica, or an
//!   adopted file whose size the namespace already agrees with.
//! - On ambiguous evidence the replica is marked broken and left alone.
//! - Namespace errors other than NotFound abort the lookup unchanged so
//!   the caller can retry.
//! - A replica with a write channel from [`ConsistencyReconciler::create_entry`]
//!   still open is a live transfer: `get` returns its record untouched and
//!   `remove` fails with [`Error::ReplicaBusy`] until the channel is closed.
//! - `clear_location_on_orphaned_upload` governs every discard of a
//!   `FROM_CLIENT` replica, with or without a data file.

use crate::alloc_channel::AllocatorAwareChannel;
use crate::allocator::{self, Allocator};
use crate::channel::FileChannel;
use crate::file_store::FileStore;
use crate::locks::{IdLocks, OpenChannels};
use crate::metadata::ReplicaStore;
use crate::namespace::{AttributeUpdate, NamespaceAttributes, NamespaceClient};
use cachepool_common::config::ReconcilerConfig;
use cachepool_common::{Error, FileId, ReplicaAttributes, ReplicaRecord, ReplicaState, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Reconciliation counters
#[derive(Debug, Default)]
pub struct ReconcilerStats {
    /// Lookups answered without the namespace
    pub fast_path: AtomicU64,
    pub namespace_queries: AtomicU64,
    /// Records brought back to a stable state
    pub repaired: AtomicU64,
    pub marked_broken: AtomicU64,
    /// Replicas deleted as unrecoverable
    pub discarded: AtomicU64,
}

/// Resolves local replicas against the namespace
pub struct ConsistencyReconciler {
    pool: String,
    files: Arc<dyn FileStore>,
    records: Arc<dyn ReplicaStore>,
    namespace: Arc<dyn NamespaceClient>,
    allocator: Arc<dyn Allocator>,
    locks: IdLocks,
    channels: OpenChannels,
    config: ReconcilerConfig,
    stats: ReconcilerStats,
}

impl ConsistencyReconciler {
    /// Create a reconciler for the pool named `pool`
    pub fn new(
        pool: impl Into<String>,
        files: Arc<dyn FileStore>,
        records: Arc<dyn ReplicaStore>,
        namespace: Arc<dyn NamespaceClient>,
        allocator: Arc<dyn Allocator>,
    ) -> Self {
        Self {
            pool: pool.into(),
            files,
            records,
            namespace,
            allocator,
            locks: IdLocks::new(),
            channels: OpenChannels::new(),
            config: ReconcilerConfig::default(),
            stats: ReconcilerStats::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Pool name registered as a location
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    pub fn records(&self) -> &Arc<dyn ReplicaStore> {
        &self.records
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    /// Whether a channel returned by `create_entry` is still open for `id`
    pub fn has_open_channel(&self, id: &FileId) -> bool {
        self.channels.is_open(id)
    }

    /// Identifiers known to either the file store or the record store
    pub fn index(&self) -> Result<Vec<FileId>> {
        let mut ids: BTreeSet<FileId> = self.files.index()?.into_iter().collect();
        ids.extend(self.records.index()?);
        Ok(ids.into_iter().collect())
    }

    /// Start a new replica in a transfer state and open it for writing
    pub async fn create_entry(
        &self,
        id: FileId,
        state: ReplicaState,
        attributes: ReplicaAttributes,
        increment: u64,
    ) -> Result<AllocatorAwareChannel<FileChannel>> {
        if !state.is_transfer() {
            return Err(Error::invalid_argument(format!(
                "replica {} cannot be created in state {}",
                id, state
            )));
        }
        if increment == 0 {
            return Err(Error::invalid_argument(
                "allocation increment must be positive",
            ));
        }

        let _guard = self.locks.lock(&id).await;
        self.records
            .create(&ReplicaRecord::new(id.clone(), state, attributes))?;
        let channel = match self.files.create(&id) {
            Ok(channel) => channel,
            Err(e) => {
                self.records.delete(&id)?;
                return Err(e);
            }
        };

        let lease = self.channels.open(&id);
        debug!("Created replica {} in {}", id, state);
        Ok(
            AllocatorAwareChannel::new(channel, self.allocator.clone(), id, increment)?
                .with_lease(lease),
        )
    }

    /// Resolve the replica for `id`, `None` if there is none (anymore)
    pub async fn get(&self, id: &FileId) -> Result<Option<ReplicaRecord>> {
        let _guard = self.locks.lock(id).await;

        if self.channels.is_open(id) {
            debug!("Replica {} is being written, skipping reconciliation", id);
            return self.records.get(id);
        }

        let record = self.records.get(id)?;
        let disk_size = self.files.size(id)?;

        match (record, disk_size) {
            (None, None) => Ok(None),
            (Some(record), None) => self.drop_orphan_record(record).await,
            (None, Some(size)) => self.adopt_orphan_file(id, size).await,
            (Some(record), Some(size)) => match record.state {
                ReplicaState::Cached | ReplicaState::Precious if record.size() == Some(size) => {
                    self.stats.fast_path.fetch_add(1, Ordering::Relaxed);
                    debug!("Replica {} is consistent ({} bytes)", id, size);
                    Ok(Some(record))
                }
                ReplicaState::Cached | ReplicaState::Precious => {
                    self.check_size_mismatch(record, size).await
                }
                ReplicaState::FromClient => self.finish_upload(record, size).await,
                ReplicaState::FromStore => self.finish_restore(record, size).await,
                ReplicaState::Broken => self.repair(record, size).await,
            },
        }
    }

    /// Delete the record and the data file, either may be absent
    pub async fn remove(&self, id: &FileId) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        if self.channels.is_open(id) {
            return Err(Error::ReplicaBusy(id.clone()));
        }

        let had_record = self.records.delete(id)?;
        let had_file = self.files.delete(id)?;
        allocator::release(self.allocator.as_ref(), id)?;

        if had_record || had_file {
            info!("Removed replica {}", id);
        }
        Ok(())
    }

    /// Query the namespace, mapping NotFound to `None`
    async fn lookup(&self, id: &FileId) -> Result<Option<NamespaceAttributes>> {
        self.stats.namespace_queries.fetch_add(1, Ordering::Relaxed);
        match self.namespace.get_attributes(id).await {
            Ok(attributes) => Ok(Some(attributes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn register(&self, id: &FileId, size: u64) -> Result<()> {
        let update = AttributeUpdate {
            size,
            location: self.pool.clone(),
        };
        self.namespace.set_attributes(id, &update).await
    }

    /// Delete everything the pool holds for `id`
    async fn discard(&self, id: &FileId, clear_location: bool) -> Result<()> {
        // Location goes first so a failed call leaves local state for a retry
        if clear_location {
            self.namespace.clear_location(id, &self.pool).await?;
        }
        self.records.delete(id)?;
        self.files.delete(id)?;
        let freed = allocator::release(self.allocator.as_ref(), id)?;

        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        debug!("Discarded replica {} ({} bytes released)", id, freed);
        Ok(())
    }

    fn mark_broken(&self, mut record: ReplicaRecord) -> Result<Option<ReplicaRecord>> {
        record.set_state(ReplicaState::Broken);
        self.records.update(&record)?;
        self.stats.marked_broken.fetch_add(1, Ordering::Relaxed);
        Ok(Some(record))
    }

    /// Trust the disk: push its size to the namespace and mark the record cached
    async fn confirm(&self, mut record: ReplicaRecord, size: u64) -> Result<Option<ReplicaRecord>> {
        record.set_size(Some(size));
        self.register(&record.id, size).await?;
        record.set_state(ReplicaState::Cached);
        self.records.update(&record)?;
        self.stats.repaired.fetch_add(1, Ordering::Relaxed);
        Ok(Some(record))
    }

    async fn drop_orphan_record(&self, record: ReplicaRecord) -> Result<Option<ReplicaRecord>> {
        warn!(
            "Replica {} ({}) has no data file, removing record",
            record.id, record.state
        );
        let clear_location = record.state != ReplicaState::FromClient
            || self.config.clear_location_on_orphaned_upload;
        self.discard(&record.id, clear_location).await?;
        Ok(None)
    }

    async fn adopt_orphan_file(&self, id: &FileId, size: u64) -> Result<Option<ReplicaRecord>> {
        let Some(ns) = self.lookup(id).await? else {
            warn!("Data file {} is unknown to the namespace, deleting", id);
            self.discard(id, false).await?;
            return Ok(None);
        };

        let attributes = ReplicaAttributes {
            size: ns.size,
            storage_class: ns.storage_class.clone(),
        };

        if ns.size == Some(size) {
            if !ns.has_location(&self.pool) {
                self.register(id, size).await?;
            }
            let record = ReplicaRecord::new(id.clone(), ReplicaState::Cached, attributes);
            self.records.create(&record)?;
            self.stats.repaired.fetch_add(1, Ordering::Relaxed);
            info!("Recovered replica {} without metadata ({} bytes)", id, size);
            Ok(Some(record))
        } else {
            let record = ReplicaRecord::new(id.clone(), ReplicaState::Broken, attributes);
            self.records.create(&record)?;
            self.stats.marked_broken.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Replica {} without metadata has {} bytes on disk, namespace says {:?}",
                id, size, ns.size
            );
            Ok(Some(record))
        }
    }

    async fn finish_upload(&self, record: ReplicaRecord, size: u64) -> Result<Option<ReplicaRecord>> {
        if self.lookup(&record.id).await?.is_none() {
            warn!("Upload {} was never registered, discarding", record.id);
            self.discard(&record.id, self.config.clear_location_on_orphaned_upload)
                .await?;
            return Ok(None);
        }

        info!("Completing interrupted upload {} ({} bytes)", record.id, size);
        self.confirm(record, size).await
    }

    async fn finish_restore(
        &self,
        mut record: ReplicaRecord,
        size: u64,
    ) -> Result<Option<ReplicaRecord>> {
        if record.size() != Some(size) {
            warn!(
                "Restore of {} is incomplete ({} of {:?} bytes), discarding",
                record.id,
                size,
                record.size()
            );
            self.discard(&record.id, true).await?;
            return Ok(None);
        }

        record.set_state(ReplicaState::Cached);
        self.records.update(&record)?;
        self.stats.repaired.fetch_add(1, Ordering::Relaxed);
        info!("Completed interrupted restore of {}", record.id);
        Ok(Some(record))
    }

    async fn repair(&self, record: ReplicaRecord, size: u64) -> Result<Option<ReplicaRecord>> {
        if self.lookup(&record.id).await?.is_none() {
            warn!("Broken replica {} is unknown to the namespace, discarding", record.id);
            self.discard(&record.id, false).await?;
            return Ok(None);
        }

        info!("Repairing broken replica {} from disk ({} bytes)", record.id, size);
        self.confirm(record, size).await
    }

    async fn check_size_mismatch(
        &self,
        mut record: ReplicaRecord,
        size: u64,
    ) -> Result<Option<ReplicaRecord>> {
        let ns_size = self.lookup(&record.id).await?.map(|ns| ns.size);

        match ns_size {
            Some(ns_size) if ns_size == Some(size) => {
                info!(
                    "Correcting stale size of {} from {:?} to {}",
                    record.id,
                    record.size(),
                    size
                );
                record.set_size(Some(size));
                self.records.update(&record)?;
                self.stats.repaired.fetch_add(1, Ordering::Relaxed);
                Ok(Some(record))
            }
            _ => {
                warn!(
                    "Replica {} has {} bytes on disk, metadata says {:?}, namespace says {:?}; marking broken",
                    record.id,
                    size,
                    record.size(),
                    ns_size.flatten()
                );
                self.mark_broken(record)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::PoolAllocator;
    use crate::channel::RepositoryChannel;
    use crate::file_store::DirectoryFileStore;
    use crate::metadata::MemoryReplicaStore;
    use crate::namespace::{MemoryNamespace, NamespaceCall};
    use tempfile::TempDir;

    const POOL: &str = "pool-a";

    struct Harness {
        _dir: TempDir,
        files: Arc<DirectoryFileStore>,
        records: Arc<MemoryReplicaStore>,
        ns: Arc<MemoryNamespace>,
        allocator: Arc<PoolAllocator>,
        reconciler: Arc<ConsistencyReconciler>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ReconcilerConfig::default())
        }

        fn with_config(config: ReconcilerConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let files = Arc::new(DirectoryFileStore::open(dir.path().join("data")).unwrap());
            let records = Arc::new(MemoryReplicaStore::new());
            let ns = Arc::new(MemoryNamespace::new());
            let allocator = Arc::new(PoolAllocator::new(1 << 30));
            let reconciler = ConsistencyReconciler::new(
                POOL,
                files.clone(),
                records.clone(),
                ns.clone(),
                allocator.clone(),
            )
            .with_config(config);

            Self {
                _dir: dir,
                files,
                records,
                ns,
                allocator,
                reconciler: Arc::new(reconciler),
            }
        }

        fn write_file(&self, id: &FileId, len: usize) {
            std::fs::write(self.files.path(id), vec![7u8; len]).unwrap();
            allocator::sync_reservation(self.allocator.as_ref(), id, len as u64).unwrap();
        }

        fn put_record(&self, id: &FileId, state: ReplicaState, size: Option<u64>) {
            let attributes = ReplicaAttributes {
                size,
                storage_class: None,
            };
            self.records
                .create(&ReplicaRecord::new(id.clone(), state, attributes))
                .unwrap();
        }

        fn ns_insert(&self, id: &FileId, size: Option<u64>, locations: &[&str]) {
            self.ns.insert(
                id.clone(),
                NamespaceAttributes {
                    size,
                    storage_class: Some("tape".into()),
                    locations: locations.iter().map(|l| (*l).to_string()).collect(),
                },
            );
        }

        fn stored(&self, id: &FileId) -> Option<ReplicaRecord> {
            self.records.get(id).unwrap()
        }
    }

    fn id(s: &str) -> FileId {
        FileId::new(s).unwrap()
    }

    fn set_attributes(id: &FileId, size: u64) -> NamespaceCall {
        NamespaceCall::SetAttributes(
            id.clone(),
            AttributeUpdate {
                size,
                location: POOL.into(),
            },
        )
    }

    #[tokio::test]
    async fn test_consistent_replica_skips_namespace() {
        let h = Harness::new();
        let a = id("A1");
        let b = id("B2");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::Cached, Some(17));
        h.write_file(&b, 3);
        h.put_record(&b, ReplicaState::Precious, Some(3));

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(Some(record), h.stored(&a));
        let record = h.reconciler.get(&b).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Precious);

        assert!(h.ns.calls().is_empty());
        assert_eq!(h.reconciler.stats().fast_path.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_nothing_known_returns_none() {
        let h = Harness::new();
        assert!(h.reconciler.get(&id("A1")).await.unwrap().is_none());
        assert!(h.ns.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stable_size_mismatch_marks_broken() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::Cached, Some(20));
        h.ns_insert(&a, Some(20), &[POOL]);

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Broken);
        assert_eq!(record.size(), Some(20));
        assert_eq!(h.stored(&a).unwrap().state, ReplicaState::Broken);
        assert!(h.ns.writes().is_empty());
        assert_eq!(h.ns.attributes(&a).unwrap().size, Some(20));
    }

    #[tokio::test]
    async fn test_three_way_disagreement_marks_broken() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::Precious, Some(20));
        h.ns_insert(&a, Some(30), &[POOL]);

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Broken);
        assert_eq!(record.size(), Some(20));
        assert!(h.ns.writes().is_empty());
    }

    #[tokio::test]
    async fn test_stale_local_size_is_corrected() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::Cached, Some(20));
        h.ns_insert(&a, Some(17), &[POOL]);

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Cached);
        assert_eq!(record.size(), Some(17));
        assert!(h.ns.writes().is_empty());

        h.ns.clear_calls();
        h.reconciler.get(&a).await.unwrap();
        assert!(h.ns.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stable_mismatch_unknown_to_namespace_marks_broken() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::Cached, Some(20));

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Broken);
        assert!(h.files.exists(&a).unwrap());
    }

    #[tokio::test]
    async fn test_interrupted_upload_is_completed() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::FromClient, None);
        h.ns_insert(&a, None, &[]);

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Cached);
        assert_eq!(record.size(), Some(17));
        assert_eq!(h.stored(&a), Some(record));

        let ns = h.ns.attributes(&a).unwrap();
        assert_eq!(ns.size, Some(17));
        assert_eq!(ns.locations, vec![POOL.to_string()]);
        assert_eq!(h.ns.writes(), vec![set_attributes(&a, 17)]);
    }

    #[tokio::test]
    async fn test_unregistered_upload_is_discarded() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::FromClient, None);

        assert!(h.reconciler.get(&a).await.unwrap().is_none());
        assert!(h.stored(&a).is_none());
        assert!(!h.files.exists(&a).unwrap());
        assert_eq!(h.allocator.reserved(&a), 0);
        assert_eq!(
            h.ns.writes(),
            vec![NamespaceCall::ClearLocation(a.clone(), POOL.into())]
        );
    }

    #[tokio::test]
    async fn test_unregistered_upload_without_location_clearing() {
        let h = Harness::with_config(ReconcilerConfig {
            clear_location_on_orphaned_upload: false,
        });
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::FromClient, None);

        assert!(h.reconciler.get(&a).await.unwrap().is_none());
        assert!(!h.files.exists(&a).unwrap());
        assert!(h.ns.writes().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_restore_is_discarded() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 10);
        h.put_record(&a, ReplicaState::FromStore, Some(17));
        h.ns_insert(&a, Some(17), &[POOL, "pool-b"]);

        assert!(h.reconciler.get(&a).await.unwrap().is_none());
        assert!(h.stored(&a).is_none());
        assert!(!h.files.exists(&a).unwrap());
        assert_eq!(
            h.ns.calls(),
            vec![NamespaceCall::ClearLocation(a.clone(), POOL.into())]
        );
        let ns = h.ns.attributes(&a).unwrap();
        assert_eq!(ns.size, Some(17));
        assert_eq!(ns.locations, vec!["pool-b".to_string()]);
    }

    #[tokio::test]
    async fn test_complete_restore_becomes_cached() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::FromStore, Some(17));

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Cached);
        assert!(h.ns.calls().is_empty());
    }

    #[tokio::test]
    async fn test_broken_replica_is_repaired_from_disk() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::Broken, Some(20));
        h.ns_insert(&a, Some(20), &["pool-b"]);

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert!(record.state.is_stable());
        assert_eq!(record.size(), Some(17));

        let ns = h.ns.attributes(&a).unwrap();
        assert_eq!(ns.size, Some(17));
        assert!(ns.has_location(POOL));
        assert_eq!(h.reconciler.stats().repaired.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_broken_replica_unknown_to_namespace_is_discarded() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::Broken, Some(20));

        assert!(h.reconciler.get(&a).await.unwrap().is_none());
        assert!(!h.files.exists(&a).unwrap());
        assert!(h.ns.writes().is_empty());
    }

    #[tokio::test]
    async fn test_file_unknown_to_namespace_is_deleted() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);

        assert!(h.reconciler.get(&a).await.unwrap().is_none());
        assert!(!h.files.exists(&a).unwrap());
        assert!(h.stored(&a).is_none());
        assert!(h.ns.writes().is_empty());
        assert_eq!(h.allocator.used(), 0);
    }

    #[tokio::test]
    async fn test_file_without_record_is_adopted() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.ns_insert(&a, Some(17), &[]);

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Cached);
        assert_eq!(record.size(), Some(17));
        assert_eq!(record.attributes.storage_class.as_deref(), Some("tape"));
        assert_eq!(h.stored(&a), Some(record));
        assert_eq!(h.ns.writes(), vec![set_attributes(&a, 17)]);
    }

    #[tokio::test]
    async fn test_adopted_file_already_registered_needs_no_write() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.ns_insert(&a, Some(17), &[POOL]);

        h.reconciler.get(&a).await.unwrap().unwrap();
        assert!(h.ns.writes().is_empty());
    }

    #[tokio::test]
    async fn test_file_without_record_and_size_mismatch_is_broken() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.ns_insert(&a, Some(20), &[]);

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Broken);
        assert_eq!(record.size(), Some(20));
        assert_eq!(h.stored(&a), Some(record));
        assert!(h.ns.writes().is_empty());
    }

    #[tokio::test]
    async fn test_record_without_file_is_dropped() {
        let h = Harness::new();
        let a = id("A1");
        h.put_record(&a, ReplicaState::Cached, Some(17));
        h.ns_insert(&a, Some(17), &[POOL]);

        assert!(h.reconciler.get(&a).await.unwrap().is_none());
        assert!(h.stored(&a).is_none());
        assert_eq!(
            h.ns.calls(),
            vec![NamespaceCall::ClearLocation(a.clone(), POOL.into())]
        );
        assert!(h.ns.attributes(&a).unwrap().locations.is_empty());
    }

    #[tokio::test]
    async fn test_namespace_timeout_propagates() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::Broken, Some(20));
        h.ns_insert(&a, Some(20), &[]);
        h.ns.set_unavailable(true);

        let err = h.reconciler.get(&a).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.stored(&a).unwrap().state, ReplicaState::Broken);
        assert!(h.files.exists(&a).unwrap());

        h.ns.set_unavailable(false);
        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Cached);
    }

    #[tokio::test]
    async fn test_remove() {
        let h = Harness::new();
        let a = id("A1");
        h.reconciler.remove(&a).await.unwrap();

        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::Cached, Some(17));
        h.reconciler.remove(&a).await.unwrap();
        assert!(h.stored(&a).is_none());
        assert!(!h.files.exists(&a).unwrap());
        assert_eq!(h.allocator.reserved(&a), 0);
        assert!(h.ns.calls().is_empty());

        h.reconciler.remove(&a).await.unwrap();
    }

    #[tokio::test]
    async fn test_index_is_union() {
        let h = Harness::new();
        h.write_file(&id("C3"), 1);
        h.put_record(&id("C3"), ReplicaState::Cached, Some(1));
        h.write_file(&id("A1"), 1);
        h.put_record(&id("B2"), ReplicaState::FromClient, None);

        assert_eq!(
            h.reconciler.index().unwrap(),
            vec![id("A1"), id("B2"), id("C3")]
        );
    }

    #[tokio::test]
    async fn test_created_entry_reconciles_after_crash() {
        let h = Harness::new();
        let a = id("A1");
        h.ns_insert(&a, None, &[]);

        let mut channel = h
            .reconciler
            .create_entry(a.clone(), ReplicaState::FromClient, ReplicaAttributes::default(), 8)
            .await
            .unwrap();
        channel.write(&[1u8; 17]).unwrap();
        assert_eq!(h.allocator.reserved(&a), 24);
        channel.close().unwrap();
        assert_eq!(h.allocator.reserved(&a), 17);

        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::Cached);
        assert_eq!(record.size(), Some(17));
    }

    #[tokio::test]
    async fn test_create_entry_rejects_stable_state() {
        let h = Harness::new();
        let err = h
            .reconciler
            .create_entry(id("A1"), ReplicaState::Cached, ReplicaAttributes::default(), 8)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(h.stored(&id("A1")).is_none());
    }

    #[tokio::test]
    async fn test_create_entry_twice_fails() {
        let h = Harness::new();
        let a = id("A1");
        let _channel = h
            .reconciler
            .create_entry(a.clone(), ReplicaState::FromStore, ReplicaAttributes::with_size(5), 8)
            .await
            .unwrap();
        let err = h
            .reconciler
            .create_entry(a.clone(), ReplicaState::FromStore, ReplicaAttributes::with_size(5), 8)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::DuplicateReplica(_)));
    }

    #[tokio::test]
    async fn test_create_entry_rejects_zero_increment() {
        let h = Harness::new();
        let a = id("A1");
        let err = h
            .reconciler
            .create_entry(a.clone(), ReplicaState::FromClient, ReplicaAttributes::default(), 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(h.stored(&a).is_none());
        assert!(!h.files.exists(&a).unwrap());
        assert!(!h.reconciler.has_open_channel(&a));
    }

    #[tokio::test]
    async fn test_remove_refused_while_channel_open() {
        let h = Harness::new();
        let a = id("A1");
        let mut channel = h
            .reconciler
            .create_entry(a.clone(), ReplicaState::FromClient, ReplicaAttributes::default(), 8)
            .await
            .unwrap();
        channel.write(&[1u8; 4]).unwrap();

        let err = h.reconciler.remove(&a).await.unwrap_err();
        assert!(matches!(err, Error::ReplicaBusy(_)));
        assert!(h.stored(&a).is_some());
        assert!(h.files.exists(&a).unwrap());
        assert_eq!(h.allocator.reserved(&a), 8);

        // Writing and closing still settle against the kept reservation
        channel.write(&[1u8; 13]).unwrap();
        assert_eq!(h.allocator.reserved(&a), 24);
        channel.close().unwrap();
        assert_eq!(h.allocator.reserved(&a), 17);
        assert!(!h.reconciler.has_open_channel(&a));

        h.reconciler.remove(&a).await.unwrap();
        assert!(h.stored(&a).is_none());
        assert_eq!(h.allocator.reserved(&a), 0);
        assert_eq!(h.allocator.used(), 0);
    }

    #[tokio::test]
    async fn test_dropped_channel_releases_replica() {
        let h = Harness::new();
        let a = id("A1");
        {
            let mut channel = h
                .reconciler
                .create_entry(a.clone(), ReplicaState::FromClient, ReplicaAttributes::default(), 8)
                .await
                .unwrap();
            channel.write(&[1u8; 5]).unwrap();
        }
        assert!(!h.reconciler.has_open_channel(&a));
        assert_eq!(h.allocator.reserved(&a), 5);

        h.reconciler.remove(&a).await.unwrap();
        assert_eq!(h.allocator.used(), 0);
    }

    #[tokio::test]
    async fn test_get_leaves_open_upload_alone() {
        let h = Harness::new();
        let a = id("A1");
        let mut channel = h
            .reconciler
            .create_entry(a.clone(), ReplicaState::FromClient, ReplicaAttributes::default(), 8)
            .await
            .unwrap();
        channel.write(&[1u8; 17]).unwrap();

        // Unknown to the namespace, but the upload is still running
        let record = h.reconciler.get(&a).await.unwrap().unwrap();
        assert_eq!(record.state, ReplicaState::FromClient);
        assert!(h.ns.calls().is_empty());
        assert!(h.files.exists(&a).unwrap());

        channel.close().unwrap();
        assert_eq!(h.allocator.reserved(&a), 17);
        assert!(h.reconciler.get(&a).await.unwrap().is_none());
        assert_eq!(h.allocator.used(), 0);
    }

    #[tokio::test]
    async fn test_upload_record_without_file_honours_location_config() {
        let h = Harness::with_config(ReconcilerConfig {
            clear_location_on_orphaned_upload: false,
        });
        let a = id("A1");
        let b = id("B2");
        h.put_record(&a, ReplicaState::FromClient, None);
        h.put_record(&b, ReplicaState::Cached, Some(3));

        assert!(h.reconciler.get(&a).await.unwrap().is_none());
        assert!(h.stored(&a).is_none());
        assert!(h.ns.calls().is_empty());

        assert!(h.reconciler.get(&b).await.unwrap().is_none());
        assert_eq!(
            h.ns.calls(),
            vec![NamespaceCall::ClearLocation(b.clone(), POOL.into())]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_confirm_once() {
        let h = Harness::new();
        let a = id("A1");
        h.write_file(&a, 17);
        h.put_record(&a, ReplicaState::FromClient, None);
        h.ns_insert(&a, None, &[]);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let reconciler = h.reconciler.clone();
            let a = a.clone();
            handles.push(tokio::spawn(async move { reconciler.get(&a).await }));
        }
        for handle in handles {
            let record = handle.await.unwrap().unwrap().unwrap();
            assert_eq!(record.state, ReplicaState::Cached);
        }

        assert_eq!(h.ns.writes(), vec![set_attributes(&a, 17)]);
        assert_eq!(h.reconciler.stats().fast_path.load(Ordering::Relaxed), 15);
    }
}
