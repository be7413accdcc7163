//! Resource store abstraction.
//!
//! Reconcilers and the prober read and write custom resources only through
//! [`ResourceStore`]. Production uses [`KubeStore`] backed by the Kubernetes
//! API; tests use the in-memory store which mimics the API server's
//! resourceVersion and generation bookkeeping.

mod kube_store;
#[cfg(test)]
mod memory;

pub use self::kube_store::KubeStore;
#[cfg(test)]
pub use self::memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors returned by a [`ResourceStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write was based on a stale resourceVersion
    #[error("Conflict writing {0}: resource was modified concurrently")]
    Conflict(String),

    /// The resource does not exist (any more)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A resource with that name already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// The resource lacks metadata required for the operation
    #[error("Resource missing {0}")]
    MissingMetadata(&'static str),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] ::kube::Error),

    /// Resource (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Watch stream error
    #[error("Watch error: {0}")]
    Watch(String),
}

impl StoreError {
    /// Whether retrying the operation after re-reading may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::MissingMetadata(_) | StoreError::Serialization(_))
    }
}

/// A change observed on a watched resource
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// Resource seen for the first time (including the initial listing)
    Added(K),
    /// Resource changed
    Modified(K),
    /// Resource removed from the store
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// The resource carried by the event
    pub fn resource(&self) -> &K {
        match self {
            WatchEvent::Added(k) | WatchEvent::Modified(k) | WatchEvent::Deleted(k) => k,
        }
    }
}

/// Access to one kind of namespaced resource.
///
/// `update` and `update_status` are conditional on the resourceVersion of the
/// resource passed in and fail with [`StoreError::Conflict`] when it is stale.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// Read a resource, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    /// List resources in a namespace, or in every watched namespace for `None`
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError>;

    /// Create a resource; its status is ignored
    async fn create(&self, resource: &K) -> Result<K, StoreError>;

    /// Write metadata (finalizers) of a resource
    async fn update(&self, resource: &K) -> Result<K, StoreError>;

    /// Write the status subresource of a resource
    async fn update_status(&self, resource: &K) -> Result<K, StoreError>;

    /// Stream of changes, starting with an `Added` event per existing resource
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>, StoreError>>;
}

/// Compute the JSON merge patch (RFC 7386) turning `old` into `new`.
///
/// Fields absent from `new` are set to `null` so they are removed on the server.
pub fn merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, new_value) in new {
                match old.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) => {
                        patch.insert(key.clone(), merge_patch(old_value, new_value));
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}
