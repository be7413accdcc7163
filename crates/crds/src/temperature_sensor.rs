//! TemperatureSensor Custom Resource Definition

use crate::device::{ConfigError, DeviceClass, DeviceConfig, DeviceResource, DeviceResourceStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// TemperatureSensorSpec defines the desired state of a temperature sensor
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "homesec.thavlik.io",
    version = "v1alpha1",
    kind = "TemperatureSensor",
    namespaced,
    status = "TemperatureSensorStatus",
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.deviceRef"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureSensorSpec {
    /// Device reference, also used to find the device's Capabilities
    pub device_ref: String,

    /// Configuration to apply to the sensor
    pub desired_config: TemperatureSensorConfig,
}

/// Temperature sensor configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureSensorConfig {
    /// Seconds between samples
    pub sampling_interval_seconds: u32,

    /// Alert threshold in degrees Celsius
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_celsius: Option<f64>,

    /// Unit readings are reported in
    #[serde(default)]
    pub unit: TemperatureUnit,
}

/// Reporting unit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

/// TemperatureSensorStatus defines the observed state of a temperature sensor
pub type TemperatureSensorStatus = DeviceResourceStatus<TemperatureSensorConfig>;

impl DeviceConfig for TemperatureSensorConfig {
    fn required_features(&self) -> BTreeSet<String> {
        let mut features = BTreeSet::new();
        features.insert("temperature".to_string());
        if self.threshold_celsius.is_some() {
            features.insert("threshold-alerts".to_string());
        }
        if self.unit == TemperatureUnit::Fahrenheit {
            features.insert("fahrenheit".to_string());
        }
        features
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling_interval_seconds == 0 {
            return Err(ConfigError::invalid("samplingIntervalSeconds", "must be greater than zero"));
        }
        if let Some(threshold) = self.threshold_celsius {
            if !threshold.is_finite() {
                return Err(ConfigError::invalid("thresholdCelsius", "must be a finite number"));
            }
        }
        Ok(())
    }
}

impl DeviceResource for TemperatureSensor {
    type Config = TemperatureSensorConfig;
    const DEVICE_CLASS: DeviceClass = DeviceClass::TemperatureSensor;

    fn device_ref(&self) -> &str {
        &self.spec.device_ref
    }

    fn desired_config(&self) -> &TemperatureSensorConfig {
        &self.spec.desired_config
    }

    fn device_status(&self) -> Option<&TemperatureSensorStatus> {
        self.status.as_ref()
    }

    fn device_status_mut(&mut self) -> &mut TemperatureSensorStatus {
        self.status.get_or_insert_with(TemperatureSensorStatus::default)
    }
}
