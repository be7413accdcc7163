//! In-memory [`ResourceStore`] for tests.
//!
//! Mimics the API server closely enough for reconciler tests: every write
//! bumps the resourceVersion, spec edits bump the generation, stale writes
//! fail with a conflict, objects with finalizers are only marked for deletion
//! and disappear once the last finalizer is removed.

use super::{ResourceStore, StoreError, WatchEvent};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

struct MemoryState<K> {
    objects: BTreeMap<(String, String), K>,
    next_version: u64,
    metadata_writes: usize,
    status_writes: usize,
    injected_conflicts: u32,
}

/// API-server stand-in holding resources in memory
pub struct MemoryStore<K> {
    state: Mutex<MemoryState<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K> Default for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn key_of<K: Resource>(resource: &K) -> Result<(String, String), StoreError> {
    let meta = resource.meta();
    let namespace = meta.namespace.clone().ok_or(StoreError::MissingMetadata("namespace"))?;
    let name = meta.name.clone().ok_or(StoreError::MissingMetadata("name"))?;
    Ok((namespace, name))
}

fn spec_of<K: Serialize>(resource: &K) -> Value {
    serde_json::to_value(resource)
        .ok()
        .and_then(|v| v.get("spec").cloned())
        .unwrap_or(Value::Null)
}

/// Copy `field` of `from` over the same field of `into`
fn with_field<K: Serialize + DeserializeOwned>(into: &K, from: &K, field: &str) -> Result<K, StoreError> {
    let mut target = serde_json::to_value(into)?;
    let source = serde_json::to_value(from)?;
    if let Value::Object(target_fields) = &mut target {
        match source.get(field) {
            Some(value) => target_fields.insert(field.to_string(), value.clone()),
            None => target_fields.remove(field),
        };
    }
    Ok(serde_json::from_value(target)?)
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MemoryState {
                objects: BTreeMap::new(),
                next_version: 1,
                metadata_writes: 0,
                status_writes: 0,
                injected_conflicts: 0,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState<K>> {
        self.state.lock().expect("memory store lock poisoned")
    }

    fn emit(&self, event: WatchEvent<K>) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn bump_version(state: &mut MemoryState<K>, resource: &mut K) {
        resource.meta_mut().resource_version = Some(state.next_version.to_string());
        state.next_version += 1;
    }

    fn check_version(state: &mut MemoryState<K>, stored: &K, written: &K, name: &str) -> Result<(), StoreError> {
        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            return Err(StoreError::Conflict(name.to_string()));
        }
        if stored.meta().resource_version != written.meta().resource_version {
            return Err(StoreError::Conflict(name.to_string()));
        }
        Ok(())
    }

    /// Create a resource as a user would, status included
    pub fn insert(&self, mut resource: K) -> K {
        let key = key_of(&resource).expect("test resource needs namespace and name");
        let mut state = self.lock();
        let meta = resource.meta_mut();
        meta.generation = Some(1);
        meta.uid = Some(format!("uid-{}-{}", key.0, key.1));
        Self::bump_version(&mut state, &mut resource);
        state.objects.insert(key, resource.clone());
        drop(state);
        self.emit(WatchEvent::Added(resource.clone()));
        resource
    }

    /// Edit a resource as a user would; spec changes bump the generation
    pub fn edit(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut K)) -> Option<K> {
        let mut state = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let mut resource = state.objects.get(&key)?.clone();
        let spec_before = spec_of(&resource);
        edit(&mut resource);
        if spec_of(&resource) != spec_before {
            let generation = resource.meta().generation.unwrap_or(0);
            resource.meta_mut().generation = Some(generation + 1);
        }
        Self::bump_version(&mut state, &mut resource);
        state.objects.insert(key, resource.clone());
        drop(state);
        self.emit(WatchEvent::Modified(resource.clone()));
        Some(resource)
    }

    /// Delete a resource as a user would; finalizers defer the removal
    pub fn delete(&self, namespace: &str, name: &str) {
        let mut state = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let Some(mut resource) = state.objects.get(&key).cloned() else {
            return;
        };
        if resource.finalizers().is_empty() {
            state.objects.remove(&key);
            drop(state);
            self.emit(WatchEvent::Deleted(resource));
            return;
        }
        if resource.meta().deletion_timestamp.is_none() {
            resource.meta_mut().deletion_timestamp =
                Some(serde_json::from_value(json!("2026-01-01T00:00:00Z")).expect("valid timestamp"));
            Self::bump_version(&mut state, &mut resource);
            state.objects.insert(key, resource.clone());
            drop(state);
            self.emit(WatchEvent::Modified(resource));
        }
    }

    /// Current stored copy of a resource
    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Make the next `count` conditional writes fail with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().injected_conflicts = count;
    }

    /// Number of successful metadata writes by the controller
    pub fn metadata_writes(&self) -> usize {
        self.lock().metadata_writes
    }

    /// Number of successful status writes by the controller
    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.snapshot(namespace, name))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|wanted| ns.as_str() == wanted))
            .map(|(_, resource)| resource.clone())
            .collect())
    }

    async fn create(&self, resource: &K) -> Result<K, StoreError> {
        let key = key_of(resource)?;
        // Status is a subresource and ignored on create
        let mut fields = serde_json::to_value(resource)?;
        if let Value::Object(map) = &mut fields {
            map.remove("status");
        }
        let mut created: K = serde_json::from_value(fields)?;

        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.1));
        }
        let meta = created.meta_mut();
        meta.generation = Some(1);
        meta.uid = Some(format!("uid-{}-{}", key.0, key.1));
        Self::bump_version(&mut state, &mut created);
        state.objects.insert(key, created.clone());
        state.metadata_writes += 1;
        drop(state);
        self.emit(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, resource: &K) -> Result<K, StoreError> {
        let key = key_of(resource)?;
        let mut state = self.lock();
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.1.clone()))?;
        Self::check_version(&mut state, &stored, resource, &key.1)?;

        let mut updated = stored;
        updated.meta_mut().finalizers = resource.meta().finalizers.clone();
        state.metadata_writes += 1;

        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.objects.remove(&key);
            drop(state);
            self.emit(WatchEvent::Deleted(updated.clone()));
            return Ok(updated);
        }

        Self::bump_version(&mut state, &mut updated);
        state.objects.insert(key, updated.clone());
        drop(state);
        self.emit(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn update_status(&self, resource: &K) -> Result<K, StoreError> {
        let key = key_of(resource)?;
        let mut state = self.lock();
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.1.clone()))?;
        Self::check_version(&mut state, &stored, resource, &key.1)?;

        let mut updated = with_field(&stored, resource, "status")?;
        Self::bump_version(&mut state, &mut updated);
        state.objects.insert(key, updated.clone());
        state.status_writes += 1;
        drop(state);
        self.emit(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>, StoreError>> {
        // Subscribe before the snapshot so no change falls in between
        let receiver = self.events.subscribe();
        let existing: Vec<Result<WatchEvent<K>, StoreError>> = self
            .lock()
            .objects
            .values()
            .cloned()
            .map(|resource| Ok(WatchEvent::Added(resource)))
            .collect();

        let changes = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        stream::iter(existing).chain(changes).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{available_capabilities, camera};
    use crds::Capabilities;

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = MemoryStore::new();
        let stored = store.insert(camera("home", "front-door", "cam-1", "1080p"));

        let mut first = stored.clone();
        first.meta_mut().finalizers = Some(vec!["a".to_string()]);
        store.update(&first).await.unwrap();

        // Second writer still holds the old resourceVersion
        let mut second = stored;
        second.meta_mut().finalizers = Some(vec!["b".to_string()]);
        assert!(matches!(store.update(&second).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_spec_edit_bumps_generation_but_status_write_does_not() {
        let store = MemoryStore::new();
        let stored = store.insert(camera("home", "front-door", "cam-1", "1080p"));
        assert_eq!(stored.metadata.generation, Some(1));

        let mut with_status = stored.clone();
        with_status.status = Some(Default::default());
        let written = store.update_status(&with_status).await.unwrap();
        assert_eq!(written.metadata.generation, Some(1));
        assert_ne!(written.metadata.resource_version, stored.metadata.resource_version);

        let edited = store
            .edit("home", "front-door", |cam| cam.spec.desired_config.resolution = "4k".into())
            .unwrap();
        assert_eq!(edited.metadata.generation, Some(2));
        assert!(edited.status.is_some());
    }

    #[tokio::test]
    async fn test_finalizer_defers_deletion() {
        let store = MemoryStore::new();
        let stored = store.insert(camera("home", "front-door", "cam-1", "1080p"));
        let mut with_finalizer = stored.clone();
        with_finalizer.meta_mut().finalizers = Some(vec!["cleanup".to_string()]);
        store.update(&with_finalizer).await.unwrap();

        store.delete("home", "front-door");
        let marked = store.snapshot("home", "front-door").unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        let mut released = marked;
        released.meta_mut().finalizers = Some(vec![]);
        store.update(&released).await.unwrap();
        assert!(store.snapshot("home", "front-door").is_none());
    }

    #[tokio::test]
    async fn test_create_ignores_status_and_rejects_duplicates() {
        let store: MemoryStore<Capabilities> = MemoryStore::new();
        let caps = available_capabilities("home", "cam-1", &["1080p"]);
        let created = store.create(&caps).await.unwrap();
        assert!(created.status.is_none());
        assert!(matches!(store.create(&caps).await, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_watch_replays_existing_then_streams_changes() {
        let store = MemoryStore::new();
        store.insert(camera("home", "front-door", "cam-1", "1080p"));
        let mut events = store.watch();

        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Added(_)))));
        store.edit("home", "front-door", |cam| cam.spec.desired_config.framerate = Some(30));
        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Modified(_)))));
    }
}
