//! Core type definitions for cachepool
//!
//! This module defines the replica data model shared by the repository,
//! the namespace client and the operator tooling.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a file identifier
pub const MAX_FILE_ID_LEN: usize = 64;

/// Namespace-assigned identifier of a file
///
/// Identifiers are used verbatim as on-disk file names and metadata keys,
/// so only ASCII alphanumeric characters are accepted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct FileId(String);

impl FileId {
    /// Create a new file identifier (validates the token)
    pub fn new(id: impl Into<String>) -> Result<Self, FileIdError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), FileIdError> {
        if id.is_empty() {
            return Err(FileIdError::Empty);
        }
        if id.len() > MAX_FILE_ID_LEN {
            return Err(FileIdError::TooLong(id.len()));
        }
        if let Some(c) = id.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(FileIdError::InvalidChar(c));
        }
        Ok(())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl FromStr for FileId {
    type Err = FileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for FileId {
    type Error = FileIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FileId> for String {
    fn from(id: FileId) -> Self {
        id.0
    }
}

impl AsRef<str> for FileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when parsing a file identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileIdError {
    #[error("file id must not be empty")]
    Empty,
    #[error("file id is {0} characters long, at most {MAX_FILE_ID_LEN} allowed")]
    TooLong(usize),
    #[error("file id contains invalid character: {0:?}")]
    InvalidChar(char),
}

/// State of a replica as recorded in the pool's metadata store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    /// Being written by a client, not yet confirmed complete
    #[display("FROM_CLIENT")]
    FromClient,
    /// Being restored from a backing tier, not yet confirmed complete
    #[display("FROM_STORE")]
    FromStore,
    /// Complete and trusted
    #[display("CACHED")]
    Cached,
    /// Complete and trusted, not yet flushed to a backing tier
    #[display("PRECIOUS")]
    Precious,
    /// A previously detected inconsistency that has not been repaired
    #[display("BROKEN")]
    Broken,
}

impl ReplicaState {
    /// Whether the replica is complete and trusted
    #[must_use]
    pub const fn is_stable(self) -> bool {
        !matches!(self, Self::FromClient | Self::FromStore | Self::Broken)
    }

    /// Whether a transfer into the pool was in progress
    #[must_use]
    pub const fn is_transfer(self) -> bool {
        matches!(self, Self::FromClient | Self::FromStore)
    }
}

/// Namespace attributes cached alongside a replica
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaAttributes {
    /// File size in bytes (unset until the namespace or the pool knows it)
    pub size: Option<u64>,
    /// Storage class / tiering hint, opaque to the pool
    pub storage_class: Option<String>,
}

impl ReplicaAttributes {
    /// Attributes carrying only a size
    #[must_use]
    pub fn with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            storage_class: None,
        }
    }
}

/// Pool-local record of a replica
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    /// Identifier of the file this replica holds
    pub id: FileId,
    /// Replica state
    pub state: ReplicaState,
    /// Cached namespace attributes
    pub attributes: ReplicaAttributes,
    /// Creation timestamp (unix millis)
    pub created_at: u64,
    /// Last state or attribute change (unix millis)
    pub last_modified: u64,
}

impl ReplicaRecord {
    /// Create a new record
    #[must_use]
    pub fn new(id: FileId, state: ReplicaState, attributes: ReplicaAttributes) -> Self {
        let now = now_millis();
        Self {
            id,
            state,
            attributes,
            created_at: now,
            last_modified: now,
        }
    }

    /// Cached size, if known
    #[must_use]
    pub const fn size(&self) -> Option<u64> {
        self.attributes.size
    }

    /// Change the replica state
    pub fn set_state(&mut self, state: ReplicaState) {
        self.state = state;
        self.last_modified = now_millis();
    }

    /// Change the cached size
    pub fn set_size(&mut self, size: Option<u64>) {
        self.attributes.size = size;
        self.last_modified = now_millis();
    }
}

/// Current time in unix millis
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
