//! Capabilities Custom Resource Definition
//!
//! Records what a physical device can do. The controller's prober creates
//! and refreshes these; device resources only read them.

use crate::device::DeviceClass;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// CapabilitiesSpec identifies the device being probed
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "homesec.thavlik.io",
    version = "v1alpha1",
    kind = "Capabilities",
    plural = "capabilities",
    namespaced,
    status = "CapabilitiesStatus",
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.deviceRef"}"#,
    printcolumn = r#"{"name":"Available","type":"boolean","jsonPath":".status.available"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesSpec {
    /// Opaque identifier/address of the device
    pub device_ref: String,

    /// Class of the device, selects the device client used for probing
    pub device_class: DeviceClass,
}

/// CapabilitiesStatus holds the result of the most recent probes
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesStatus {
    /// Whether the device is reachable and its features are current
    #[serde(default)]
    pub available: bool,

    /// Feature tags advertised by the device
    #[serde(default)]
    pub supported_features: BTreeSet<String>,

    /// Time of the last successful probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probed_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Probe failures since the last success
    #[serde(default)]
    pub consecutive_failures: u32,

    /// Device model, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Firmware version, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,

    /// Error from the last failed probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Capabilities {
    /// True when the status says the device is available.
    pub fn is_available(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.available)
    }

    /// Supported feature tags, empty when never probed.
    pub fn supported_features(&self) -> BTreeSet<String> {
        self.status
            .as_ref()
            .map(|s| s.supported_features.clone())
            .unwrap_or_default()
    }
}

/// Derives a valid object name for the Capabilities of `device_ref`.
///
/// Lowercases, maps every character outside `[a-z0-9-]` to `-`, collapses
/// runs of `-` and trims them from both ends. Names are capped at 63 bytes.
pub fn capabilities_name(device_ref: &str) -> String {
    let mut name = String::with_capacity(device_ref.len());
    for ch in device_ref.chars().flat_map(char::to_lowercase) {
        let ch = if ch.is_ascii_alphanumeric() { ch } else { '-' };
        if ch == '-' && name.ends_with('-') {
            continue;
        }
        name.push(ch);
    }
    let mut name = name.trim_matches('-').to_string();
    name.truncate(63);
    let name = name.trim_end_matches('-');
    if name.is_empty() {
        "device".to_string()
    } else {
        name.to_string()
    }
}
