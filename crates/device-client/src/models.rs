//! Device proxy API models

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Features a device advertises
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    /// Feature tags, e.g. "1080p", "night-vision", "temperature"
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// Live status reported by a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceStatus {
    /// Whether the device answered the proxy's last heartbeat
    #[serde(default)]
    pub online: bool,
    /// Configuration currently active on the device, in the same shape the
    /// controller applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

/// Error body returned by the proxy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
}
