//! Shared shape of device resources.
//!
//! `Camera` and `TemperatureSensor` differ only in their desired
//! configuration. Everything the reconciler needs from them is expressed by
//! the [`DeviceResource`] trait, so the controller is written once and
//! instantiated per kind.

use crate::condition::Condition;
use k8s_openapi::NamespaceResourceScope;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Class of physical device behind a `DeviceRef`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DeviceClass {
    Camera,
    TemperatureSensor,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Camera => write!(f, "camera"),
            DeviceClass::TemperatureSensor => write!(f, "temperatureSensor"),
        }
    }
}

/// A desired configuration that is malformed on its own, independent of
/// what the device supports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField { field, reason: reason.into() }
    }
}

/// Device-class-specific configuration carried in `spec.desiredConfig`.
pub trait DeviceConfig:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Feature tags the device must advertise for this configuration to be applied.
    fn required_features(&self) -> BTreeSet<String>;

    /// Checks the configuration for values no device could accept.
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Observed state shared by every device resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", bound(deserialize = "C: DeserializeOwned"))]
pub struct DeviceResourceStatus<C> {
    /// Configuration last reported by the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_config: Option<C>,

    /// Generation of the spec that was last fully converged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Health conditions, ordered by first appearance
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl<C> Default for DeviceResourceStatus<C> {
    fn default() -> Self {
        Self {
            observed_config: None,
            observed_generation: None,
            conditions: Vec::new(),
        }
    }
}

/// A namespaced custom resource representing one physical device.
pub trait DeviceResource:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Typed desired configuration
    type Config: DeviceConfig;

    /// Device class used to pick a device client
    const DEVICE_CLASS: DeviceClass;

    /// Opaque identifier of the device
    fn device_ref(&self) -> &str;

    /// Desired configuration from the spec
    fn desired_config(&self) -> &Self::Config;

    /// Observed status, if any has been written
    fn device_status(&self) -> Option<&DeviceResourceStatus<Self::Config>>;

    /// Mutable status, created empty when missing
    fn device_status_mut(&mut self) -> &mut DeviceResourceStatus<Self::Config>;
}

/// Returns the features required by `config` that `supported` lacks, sorted.
pub fn unsupported_features<C: DeviceConfig>(config: &C, supported: &BTreeSet<String>) -> Vec<String> {
    config
        .required_features()
        .into_iter()
        .filter(|feature| !supported.contains(feature))
        .collect()
}
