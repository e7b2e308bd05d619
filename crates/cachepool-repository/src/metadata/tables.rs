//! Redb table definitions for replica metadata.

use redb::TableDefinition;

// Key: file identifier, Value: bincode-encoded ReplicaRecord
pub const REPLICAS: TableDefinition<&str, &[u8]> = TableDefinition::new("replicas");
