//! Namespace service abstraction
//!
//! The namespace is the authority on whether a file exists, how large it
//! is, and which pools hold a copy. The reconciler only talks to it
//! through [`NamespaceClient`].

use async_trait::async_trait;
use cachepool_common::{Error, FileId, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Attributes the namespace holds for a file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceAttributes {
    /// Authoritative size, unset while an upload is unfinished
    pub size: Option<u64>,
    /// Opaque storage class hint
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Pools holding a replica
    #[serde(default)]
    pub locations: Vec<String>,
}

impl NamespaceAttributes {
    pub fn has_location(&self, pool: &str) -> bool {
        self.locations.iter().any(|l| l == pool)
    }
}

/// Size and location pushed to the namespace for a complete replica
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub size: u64,
    pub location: String,
}

/// Client for the remote namespace service
///
/// Every error except [`Error::FileNotFound`] from `get_attributes` is a
/// failure the caller should treat as retryable or fatal.
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Fetch attributes, `Err(FileNotFound)` if the file is unknown
    async fn get_attributes(&self, id: &FileId) -> Result<NamespaceAttributes>;

    /// Record the size and add the location, idempotent
    async fn set_attributes(&self, id: &FileId, update: &AttributeUpdate) -> Result<()>;

    /// Remove `pool` from the file's locations, safe when not registered
    async fn clear_location(&self, id: &FileId, pool: &str) -> Result<()>;
}

/// A call observed by [`MemoryNamespace`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceCall {
    GetAttributes(FileId),
    SetAttributes(FileId, AttributeUpdate),
    ClearLocation(FileId, String),
}

impl NamespaceCall {
    /// Whether the call modifies namespace state
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::GetAttributes(_))
    }
}

/// In-process namespace that records every call
#[derive(Default)]
pub struct MemoryNamespace {
    files: RwLock<HashMap<FileId, NamespaceAttributes>>,
    calls: Mutex<Vec<NamespaceCall>>,
    unavailable: Mutex<bool>,
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file
    pub fn insert(&self, id: FileId, attributes: NamespaceAttributes) {
        self.files.write().insert(id, attributes);
    }

    /// Current attributes of a file
    pub fn attributes(&self, id: &FileId) -> Option<NamespaceAttributes> {
        self.files.read().get(id).cloned()
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<NamespaceCall> {
        self.calls.lock().clone()
    }

    /// Calls that modified namespace state
    pub fn writes(&self) -> Vec<NamespaceCall> {
        self.calls.lock().iter().filter(|c| c.is_write()).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Make every subsequent call fail with a timeout
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    fn record(&self, call: NamespaceCall) -> Result<()> {
        self.calls.lock().push(call);
        if *self.unavailable.lock() {
            return Err(Error::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl NamespaceClient for MemoryNamespace {
    async fn get_attributes(&self, id: &FileId) -> Result<NamespaceAttributes> {
        self.record(NamespaceCall::GetAttributes(id.clone()))?;
        self.attributes(id)
            .ok_or_else(|| Error::FileNotFound(id.clone()))
    }

    async fn set_attributes(&self, id: &FileId, update: &AttributeUpdate) -> Result<()> {
        self.record(NamespaceCall::SetAttributes(id.clone(), update.clone()))?;
        let mut files = self.files.write();
        let attributes = files
            .get_mut(id)
            .ok_or_else(|| Error::FileNotFound(id.clone()))?;
        attributes.size = Some(update.size);
        if !attributes.has_location(&update.location) {
            attributes.locations.push(update.location.clone());
        }
        Ok(())
    }

    async fn clear_location(&self, id: &FileId, pool: &str) -> Result<()> {
        self.record(NamespaceCall::ClearLocation(id.clone(), pool.to_string()))?;
        if let Some(attributes) = self.files.write().get_mut(id) {
            attributes.locations.retain(|l| l != pool);
        }
        Ok(())
    }
}
