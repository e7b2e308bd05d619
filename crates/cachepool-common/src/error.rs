//! Error types for cachepool
//!
//! This module defines the common error types used throughout the system.

use crate::types::{FileId, FileIdError};
use thiserror::Error;

/// Common result type for cachepool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for cachepool
#[derive(Debug, Error)]
pub enum Error {
    // Local storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("replica metadata error: {0}")]
    Metadata(String),

    #[error("replica already exists: {0}")]
    DuplicateReplica(FileId),

    // Space accounting errors
    #[error("insufficient space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("allocator underflow for {id}: freeing {requested} bytes, only {reserved} reserved")]
    AllocatorUnderflow {
        id: FileId,
        requested: u64,
        reserved: u64,
    },

    // Namespace errors
    #[error("file not found in namespace: {0}")]
    FileNotFound(FileId),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // Request errors
    #[error("invalid file id: {0}")]
    InvalidFileId(#[from] FileIdError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("replica is open for writing: {0}")]
    ReplicaBusy(FileId),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a replica metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ServiceUnavailable(_) | Self::ConnectionFailed(_)
        )
    }

    /// Check if this is the namespace reporting an unknown file
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound(_))
    }
}
