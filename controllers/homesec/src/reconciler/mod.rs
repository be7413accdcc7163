//! Reconciliation logic for device resources.
//!
//! A [`Reconcile`] implementation drives one resource kind toward its desired
//! state. Reconcilers are looked up by [`ResourceKind`] in a
//! [`ReconcilerRegistry`] that the controller builds at startup.

mod device;

pub use device::DeviceReconciler;

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{Camera, DeviceClass, DeviceResource, TemperatureSensor};
use device_client::DeviceClient;
use kube::ResourceExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Reconciler for Camera resources
pub type CameraReconciler = DeviceReconciler<Camera>;

/// Reconciler for TemperatureSensor resources
pub type TemperatureSensorReconciler = DeviceReconciler<TemperatureSensor>;

/// Resource kinds that are reconciled through the work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Camera,
    TemperatureSensor,
}

impl ResourceKind {
    pub fn for_device_class(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Camera => ResourceKind::Camera,
            DeviceClass::TemperatureSensor => ResourceKind::TemperatureSensor,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Camera => write!(f, "Camera"),
            ResourceKind::TemperatureSensor => write!(f, "TemperatureSensor"),
        }
    }
}

/// Identity of a resource to reconcile: `(kind, namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Key for `kind` named `name` in `namespace`
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a device resource, `None` when it lacks a namespace or name
    pub fn for_resource<K: DeviceResource>(resource: &K) -> Option<Self> {
        let namespace = resource.namespace()?;
        let name = resource.meta().name.clone()?;
        Some(Self::new(ResourceKind::for_device_class(K::DEVICE_CLASS), namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// What the worker should do with a key after a successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Nothing to do until the resource changes (or the next resync)
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Drives resources of one kind toward their desired state
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Reconcile the resource identified by `key`.
    ///
    /// The resource is re-read from the store; a missing resource is not an error.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError>;

    /// Keys of every resource of this kind, used by the periodic resync
    async fn list_keys(&self) -> Result<Vec<ObjectKey>, ControllerError>;
}

/// Reconcilers by resource kind
#[derive(Default, Clone)]
pub struct ReconcilerRegistry {
    reconcilers: HashMap<ResourceKind, Arc<dyn Reconcile>>,
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ResourceKind, reconciler: Arc<dyn Reconcile>) {
        self.reconcilers.insert(kind, reconciler);
    }

    pub fn get(&self, kind: ResourceKind) -> Option<Arc<dyn Reconcile>> {
        self.reconcilers.get(&kind).cloned()
    }

    /// Registered kinds in a stable order
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self.reconcilers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Device clients by device class
#[derive(Default, Clone)]
pub struct DeviceClients {
    clients: HashMap<DeviceClass, Arc<dyn DeviceClient>>,
}

impl DeviceClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, class: DeviceClass, client: Arc<dyn DeviceClient>) -> Self {
        self.clients.insert(class, client);
        self
    }

    pub fn get(&self, class: DeviceClass) -> Result<Arc<dyn DeviceClient>, ControllerError> {
        self.clients
            .get(&class)
            .cloned()
            .ok_or(ControllerError::NoDeviceClient(class))
    }
}
