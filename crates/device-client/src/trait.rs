//! DeviceClient trait
//!
//! The controller only ever talks to devices through this trait. The proxy
//! clients implement it per device class, and tests use `MockDeviceClient`.

use crate::error::DeviceError;
use crate::models::{CapabilitySet, DeviceStatus};

/// Capability interface over a physical device
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait DeviceClient: Send + Sync {
    /// Base URL of the proxy, for logging
    fn base_url(&self) -> &str;

    /// Features the device supports
    async fn fetch_capabilities(&self, device_ref: &str) -> Result<CapabilitySet, DeviceError>;

    /// Current device status
    async fn fetch_status(&self, device_ref: &str) -> Result<DeviceStatus, DeviceError>;

    /// Applies the full desired configuration. Re-applying the same
    /// configuration must leave the device unchanged.
    async fn apply(&self, device_ref: &str, desired_config: &serde_json::Value) -> Result<(), DeviceError>;

    /// Releases the device. Deregistering an unknown device returns `NotFound`.
    async fn deregister(&self, device_ref: &str) -> Result<(), DeviceError>;
}
