//! Status conditions shared by device resources.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported on every device resource
pub const READY: &str = "Ready";

/// Stable reason codes written into `Condition::reason`
pub mod reason {
    /// Desired configuration applied and observed on the device
    pub const RECONCILED: &str = "Reconciled";
    /// Capabilities resource missing or reporting the device unavailable
    pub const CAPABILITIES_UNAVAILABLE: &str = "CapabilitiesUnavailable";
    /// Desired configuration requests a feature the device lacks
    pub const UNSUPPORTED_FEATURE: &str = "UnsupportedFeature";
    /// Desired configuration is malformed
    pub const INVALID_CONFIG: &str = "InvalidConfig";
    /// Device rejected or failed to apply the configuration
    pub const APPLY_FAILED: &str = "ApplyFailed";
    /// Configuration applied but the device status could not be read back
    pub const STATUS_UNAVAILABLE: &str = "StatusUnavailable";
    /// Device could not be deregistered during deletion
    pub const DEREGISTER_FAILED: &str = "DeregisterFailed";
}

/// A typed health signal with reason and message.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Ready")
    #[serde(rename = "type")]
    pub type_: String,

    /// Whether the condition holds
    pub status: ConditionStatus,

    /// Machine-readable reason code
    pub reason: String,

    /// Human-readable detail
    #[serde(default)]
    pub message: String,

    /// Last time `status` changed
    pub last_transition_time: DateTime<Utc>,
}

/// Condition status
///
/// Serializes as PascalCase ("True", "False", "Unknown") to match the
/// Kubernetes condition convention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl Condition {
    /// Builds a condition stamped with `now` as its transition time.
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: now,
        }
    }
}

/// Finds a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}
