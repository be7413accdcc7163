//! [`ResourceStore`] backed by the Kubernetes API.

use super::{merge_patch, ResourceStore, StoreError, WatchEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::watcher::{self, watcher, Event};
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::marker::PhantomData;
use tracing::debug;

/// Store for one namespaced custom resource kind
pub struct KubeStore<K> {
    client: Client,
    /// Namespace scope for list and watch, cluster-wide when `None`
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    /// Store scoped to `namespace`, or all namespaces when `None`
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self {
            client,
            namespace,
            _kind: PhantomData,
        }
    }

    fn namespaced(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped(&self, namespace: Option<&str>) -> Api<K> {
        match namespace.or(self.namespace.as_deref()) {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Identity of a resource about to be written
fn write_target<K: Resource>(resource: &K) -> Result<(String, String, String), StoreError> {
    let meta = resource.meta();
    let name = meta.name.clone().ok_or(StoreError::MissingMetadata("name"))?;
    let namespace = meta.namespace.clone().ok_or(StoreError::MissingMetadata("namespace"))?;
    let resource_version = meta
        .resource_version
        .clone()
        .ok_or(StoreError::MissingMetadata("resourceVersion"))?;
    Ok((namespace, name, resource_version))
}

fn map_api_error(err: kube::Error, what: &str) -> StoreError {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => StoreError::NotFound(what.to_string()),
        kube::Error::Api(ref response) if response.code == 409 => StoreError::Conflict(what.to_string()),
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.namespaced(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_api_error(e, name))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        let list = self.scoped(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create(&self, resource: &K) -> Result<K, StoreError> {
        let name = resource.name_any();
        let namespace = resource
            .meta()
            .namespace
            .clone()
            .ok_or(StoreError::MissingMetadata("namespace"))?;
        match self.namespaced(&namespace).create(&PostParams::default(), resource).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ref response)) if response.code == 409 => Err(StoreError::AlreadyExists(name)),
            Err(e) => Err(map_api_error(e, &name)),
        }
    }

    async fn update(&self, resource: &K) -> Result<K, StoreError> {
        let (namespace, name, resource_version) = write_target(resource)?;
        // Only finalizers are owned by the controller; the resourceVersion
        // makes the API server reject the patch if the object moved on
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": resource.meta().finalizers.clone().unwrap_or_default(),
            }
        });
        debug!("Patching metadata of {}/{}", namespace, name);
        self.namespaced(&namespace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_api_error(e, &name))
    }

    async fn update_status(&self, resource: &K) -> Result<K, StoreError> {
        let (namespace, name, resource_version) = write_target(resource)?;
        let api = self.namespaced(&namespace);

        let current = api
            .get_opt(&name)
            .await
            .map_err(|e| map_api_error(e, &name))?
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        if current.meta().resource_version.as_deref() != Some(resource_version.as_str()) {
            return Err(StoreError::Conflict(name));
        }

        let current_status = serde_json::to_value(&current)?
            .get("status")
            .cloned()
            .unwrap_or(Value::Null);
        let desired_status = serde_json::to_value(resource)?
            .get("status")
            .cloned()
            .unwrap_or(Value::Null);
        let status_patch = merge_patch(&current_status, &desired_status);
        if current_status == desired_status || status_patch.as_object().is_some_and(|fields| fields.is_empty()) {
            debug!("Status of {}/{} already up to date", namespace, name);
            return Ok(current);
        }

        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status_patch,
        });
        debug!("Patching status of {}/{}", namespace, name);
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_api_error(e, &name))
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>, StoreError>> {
        watcher(self.scoped(None), watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(Event::InitApply(resource)) => Some(Ok(WatchEvent::Added(resource))),
                    Ok(Event::Apply(resource)) => Some(Ok(WatchEvent::Modified(resource))),
                    Ok(Event::Delete(resource)) => Some(Ok(WatchEvent::Deleted(resource))),
                    Ok(Event::Init) | Ok(Event::InitDone) => None,
                    Err(e) => Some(Err(StoreError::Watch(e.to_string()))),
                }
            })
            .boxed()
    }
}
