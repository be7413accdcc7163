//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use crate::reconciler::{DeviceClients, DeviceReconciler};
#[cfg(test)]
use crate::store::MemoryStore;
#[cfg(test)]
use chrono::Utc;
#[cfg(test)]
use crds::*;
#[cfg(test)]
use device_client::MockDeviceClient;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use std::collections::BTreeSet;
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Helper to create a test Camera without status
#[cfg(test)]
pub fn camera(namespace: &str, name: &str, device_ref: &str, resolution: &str) -> Camera {
    Camera {
        metadata: meta(namespace, name),
        spec: CameraSpec {
            device_ref: device_ref.to_string(),
            desired_config: CameraConfig {
                resolution: resolution.to_string(),
                framerate: None,
                night_vision: None,
            },
        },
        status: None,
    }
}

/// Helper to create a test TemperatureSensor without status
#[cfg(test)]
pub fn temperature_sensor(namespace: &str, name: &str, device_ref: &str, interval_seconds: u32) -> TemperatureSensor {
    TemperatureSensor {
        metadata: meta(namespace, name),
        spec: TemperatureSensorSpec {
            device_ref: device_ref.to_string(),
            desired_config: TemperatureSensorConfig {
                sampling_interval_seconds: interval_seconds,
                threshold_celsius: None,
                unit: TemperatureUnit::Celsius,
            },
        },
        status: None,
    }
}

/// Helper to create Capabilities for an available device
#[cfg(test)]
pub fn available_capabilities(namespace: &str, device_ref: &str, features: &[&str]) -> Capabilities {
    let mut caps = unavailable_capabilities(namespace, device_ref);
    caps.status = Some(CapabilitiesStatus {
        available: true,
        supported_features: features.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>(),
        last_probed_at: Some(Utc::now()),
        ..Default::default()
    });
    caps
}

/// Helper to create Capabilities for a device that was never probed successfully
#[cfg(test)]
pub fn unavailable_capabilities(namespace: &str, device_ref: &str) -> Capabilities {
    Capabilities {
        metadata: meta(namespace, &capabilities_name(device_ref)),
        spec: CapabilitiesSpec {
            device_ref: device_ref.to_string(),
            device_class: DeviceClass::Camera,
        },
        status: None,
    }
}

/// Device clients that route both device classes to `device`
#[cfg(test)]
pub fn clients_for(device: &Arc<MockDeviceClient>) -> DeviceClients {
    DeviceClients::new()
        .with(DeviceClass::Camera, device.clone())
        .with(DeviceClass::TemperatureSensor, device.clone())
}

/// Stores, mock device and reconciler wired together for one device kind
#[cfg(test)]
pub struct TestHarness<K: DeviceResource> {
    pub store: Arc<MemoryStore<K>>,
    pub capabilities: Arc<MemoryStore<Capabilities>>,
    pub device: Arc<MockDeviceClient>,
    pub reconciler: DeviceReconciler<K>,
}

/// Retry interval used by harness reconcilers while Capabilities are missing
#[cfg(test)]
pub const TEST_CAPABILITIES_RETRY: Duration = Duration::from_secs(15);

#[cfg(test)]
impl<K: DeviceResource> TestHarness<K> {
    pub fn new() -> Self {
        let store: Arc<MemoryStore<K>> = Arc::new(MemoryStore::new());
        let capabilities: Arc<MemoryStore<Capabilities>> = Arc::new(MemoryStore::new());
        let device = Arc::new(MockDeviceClient::default());
        let reconciler = DeviceReconciler::new(
            store.clone(),
            capabilities.clone(),
            device.clone(),
            TEST_CAPABILITIES_RETRY,
        );
        Self {
            store,
            capabilities,
            device,
            reconciler,
        }
    }
}
