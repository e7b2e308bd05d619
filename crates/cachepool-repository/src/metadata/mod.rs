//! Replica metadata storage
//!
//! Every replica has at most one [`ReplicaRecord`] keyed by its
//! identifier. The record is the pool's local view of the replica's state
//! and cached attributes.
//!
//! Two implementations share the [`ReplicaStore`] contract:
//! - [`RedbReplicaStore`]: durable, one redb write transaction per mutation
//! - [`MemoryReplicaStore`]: in-process, for tests and dry runs
//!
//! [`ReplicaRecord`]: cachepool_common::ReplicaRecord

mod persistent;
mod store;
mod tables;

pub use persistent::{RedbReplicaStore, ReplicaStoreError, ReplicaStoreResult};
pub use store::{MemoryReplicaStore, ReplicaStore};
