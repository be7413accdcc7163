//! Device proxy clients
//!
//! One client per device class. Both speak the same proxy API under a
//! class-specific prefix:
//!
//! - `GET    /api/v1/{class}/{deviceRef}/capabilities`
//! - `GET    /api/v1/{class}/{deviceRef}/status`
//! - `PUT    /api/v1/{class}/{deviceRef}/config`
//! - `DELETE /api/v1/{class}/{deviceRef}`

use crate::common::HttpClient;
use crate::device_trait::DeviceClient;
use crate::error::DeviceError;
use crate::models::{CapabilitySet, DeviceStatus};
use std::time::Duration;
use tracing::debug;

/// Requests shared by every device class
#[derive(Debug, Clone)]
struct ProxyClient {
    http: HttpClient,
    class_path: &'static str,
}

impl ProxyClient {
    fn new(
        base_url: String,
        token: Option<String>,
        timeout: Duration,
        class_path: &'static str,
    ) -> Result<Self, DeviceError> {
        Ok(Self {
            http: HttpClient::new(base_url, token, timeout)?,
            class_path,
        })
    }

    fn device_path(&self, device_ref: &str) -> String {
        format!("/api/v1/{}/{}", self.class_path, urlencoding::encode(device_ref))
    }

    async fn fetch_capabilities(&self, device_ref: &str) -> Result<CapabilitySet, DeviceError> {
        self.http.get(&format!("{}/capabilities", self.device_path(device_ref))).await
    }

    async fn fetch_status(&self, device_ref: &str) -> Result<DeviceStatus, DeviceError> {
        self.http.get(&format!("{}/status", self.device_path(device_ref))).await
    }

    async fn apply(&self, device_ref: &str, desired_config: &serde_json::Value) -> Result<(), DeviceError> {
        self.http.put(&format!("{}/config", self.device_path(device_ref)), desired_config).await
    }

    async fn deregister(&self, device_ref: &str) -> Result<(), DeviceError> {
        self.http.delete(&self.device_path(device_ref)).await
    }
}

/// Client for cameras
#[derive(Debug, Clone)]
pub struct CameraClient {
    inner: ProxyClient,
}

impl CameraClient {
    /// Create a new camera client
    ///
    /// # Arguments
    /// * `base_url` - Device proxy base URL (e.g., "http://device-proxy:8080")
    /// * `token` - Optional bearer token
    /// * `timeout` - Per-request timeout
    pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Result<Self, DeviceError> {
        Ok(Self {
            inner: ProxyClient::new(base_url, token, timeout, "cameras")?,
        })
    }
}

#[async_trait::async_trait]
impl DeviceClient for CameraClient {
    fn base_url(&self) -> &str {
        self.inner.http.base_url()
    }

    async fn fetch_capabilities(&self, device_ref: &str) -> Result<CapabilitySet, DeviceError> {
        self.inner.fetch_capabilities(device_ref).await
    }

    async fn fetch_status(&self, device_ref: &str) -> Result<DeviceStatus, DeviceError> {
        self.inner.fetch_status(device_ref).await
    }

    async fn apply(&self, device_ref: &str, desired_config: &serde_json::Value) -> Result<(), DeviceError> {
        debug!("Applying camera config to {}", device_ref);
        self.inner.apply(device_ref, desired_config).await
    }

    async fn deregister(&self, device_ref: &str) -> Result<(), DeviceError> {
        self.inner.deregister(device_ref).await
    }
}

/// Client for temperature sensors
#[derive(Debug, Clone)]
pub struct TemperatureSensorClient {
    inner: ProxyClient,
}

impl TemperatureSensorClient {
    /// Create a new temperature sensor client
    pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Result<Self, DeviceError> {
        Ok(Self {
            inner: ProxyClient::new(base_url, token, timeout, "temperature-sensors")?,
        })
    }
}

#[async_trait::async_trait]
impl DeviceClient for TemperatureSensorClient {
    fn base_url(&self) -> &str {
        self.inner.http.base_url()
    }

    async fn fetch_capabilities(&self, device_ref: &str) -> Result<CapabilitySet, DeviceError> {
        self.inner.fetch_capabilities(device_ref).await
    }

    async fn fetch_status(&self, device_ref: &str) -> Result<DeviceStatus, DeviceError> {
        self.inner.fetch_status(device_ref).await
    }

    async fn apply(&self, device_ref: &str, desired_config: &serde_json::Value) -> Result<(), DeviceError> {
        debug!("Applying temperature sensor config to {}", device_ref);
        self.inner.apply(device_ref, desired_config).await
    }

    async fn deregister(&self, device_ref: &str) -> Result<(), DeviceError> {
        self.inner.deregister(device_ref).await
    }
}
