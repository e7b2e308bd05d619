//! Configuration types for cachepool
//!
//! This module defines the pool configuration loaded by the operator
//! tooling. Every section falls back to its defaults when omitted.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default allocation increment (50 MiB)
pub const DEFAULT_ALLOCATION_INCREMENT: u64 = 50 * 1024 * 1024;

/// Root configuration for a pool
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pool identity and local storage
    pub pool: PoolConfig,
    /// Namespace service endpoint
    pub namespace: NamespaceConfig,
    /// Reconciliation behaviour
    pub reconciler: ReconcilerConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Check the configuration for values the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool.name.trim().is_empty() {
            return Err(Error::Configuration("pool name must not be empty".into()));
        }
        if self.pool.allocation_increment == 0 {
            return Err(Error::Configuration(
                "allocation increment must be positive".into(),
            ));
        }
        if self.pool.scan_concurrency == 0 {
            return Err(Error::Configuration(
                "scan concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Pool identity and local storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name, registered as a location in the namespace
    pub name: String,
    /// Base directory for replica data and metadata
    pub data_dir: PathBuf,
    /// Space budget in bytes
    pub capacity: u64,
    /// Allocation granularity for write channels
    pub allocation_increment: u64,
    /// Maximum parallel reconciliations during the startup scan
    pub scan_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            data_dir: PathBuf::from("./pool-data"),
            capacity: 1024 * 1024 * 1024 * 1024, // 1 TiB
            allocation_increment: DEFAULT_ALLOCATION_INCREMENT,
            scan_concurrency: 16,
        }
    }
}

impl PoolConfig {
    /// Directory holding replica data files
    #[must_use]
    pub fn replica_dir(&self) -> PathBuf {
        self.data_dir.join("data")
    }

    /// Path of the replica metadata database
    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("meta").join("replicas.redb")
    }
}

/// Namespace service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Base URL of the namespace API
    pub url: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:2288/api/v1/namespace".to_string(),
            timeout_ms: 30_000,
        }
    }
}

/// Reconciliation behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Retract this pool's location when discarding an upload the
    /// namespace never registered
    pub clear_location_on_orphaned_upload: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            clear_location_on_orphaned_upload: true,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
