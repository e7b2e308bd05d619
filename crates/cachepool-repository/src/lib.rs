//! cachepool Repository - Replica storage and consistency reconciliation
//!
//! This crate implements the pool side of replica management:
//! - Replica data files on local disk
//! - Durable replica metadata (redb)
//! - Space accounting with allocation-aware write channels
//! - Reconciliation of disk, metadata and namespace after a crash
//! - Startup scan over every known replica

pub mod alloc_channel;
pub mod allocator;
pub mod channel;
pub mod file_store;
pub mod locks;
pub mod metadata;
pub mod namespace;
pub mod reconciler;
pub mod scanner;

#[cfg(test)]
mod test_support;

// Re-exports
pub use alloc_channel::AllocatorAwareChannel;
pub use allocator::{Allocator, PoolAllocator};
pub use channel::{FileChannel, RepositoryChannel};
pub use file_store::{DirectoryFileStore, FileStore, OpenMode};
pub use locks::{ChannelLease, IdLocks, OpenChannels};
pub use metadata::{MemoryReplicaStore, RedbReplicaStore, ReplicaStore, ReplicaStoreError};
pub use namespace::{
    AttributeUpdate, MemoryNamespace, NamespaceAttributes, NamespaceCall, NamespaceClient,
};
pub use reconciler::{ConsistencyReconciler, ReconcilerStats};
pub use scanner::{ReplicaScanner, ScanReport};
