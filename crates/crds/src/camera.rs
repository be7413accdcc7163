//! Camera Custom Resource Definition

use crate::device::{ConfigError, DeviceClass, DeviceConfig, DeviceResource, DeviceResourceStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// CameraSpec defines the desired state of a camera
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "homesec.thavlik.io",
    version = "v1alpha1",
    kind = "Camera",
    namespaced,
    status = "CameraStatus",
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.deviceRef"}"#,
    printcolumn = r#"{"name":"Resolution","type":"string","jsonPath":".spec.desiredConfig.resolution"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CameraSpec {
    /// Device reference, also used to find the device's Capabilities
    pub device_ref: String,

    /// Configuration to apply to the camera
    pub desired_config: CameraConfig,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    /// Resolution tag (e.g. "1080p")
    pub resolution: String,

    /// Frames per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<u32>,

    /// Infrared night vision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub night_vision: Option<bool>,
}

/// CameraStatus defines the observed state of a camera
pub type CameraStatus = DeviceResourceStatus<CameraConfig>;

impl DeviceConfig for CameraConfig {
    fn required_features(&self) -> BTreeSet<String> {
        let mut features = BTreeSet::new();
        features.insert(self.resolution.clone());
        if let Some(fps) = self.framerate {
            features.insert(format!("{fps}fps"));
        }
        if self.night_vision == Some(true) {
            features.insert("night-vision".to_string());
        }
        features
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.resolution.trim().is_empty() {
            return Err(ConfigError::invalid("resolution", "must not be empty"));
        }
        if self.framerate == Some(0) {
            return Err(ConfigError::invalid("framerate", "must be greater than zero"));
        }
        Ok(())
    }
}

impl DeviceResource for Camera {
    type Config = CameraConfig;
    const DEVICE_CLASS: DeviceClass = DeviceClass::Camera;

    fn device_ref(&self) -> &str {
        &self.spec.device_ref
    }

    fn desired_config(&self) -> &CameraConfig {
        &self.spec.desired_config
    }

    fn device_status(&self) -> Option<&CameraStatus> {
        self.status.as_ref()
    }

    fn device_status_mut(&mut self) -> &mut CameraStatus {
        self.status.get_or_insert_with(CameraStatus::default)
    }
}
