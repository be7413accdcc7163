//! homesec CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the homesec controller.
//!
//! - `Capabilities`: what a physical device can do, maintained by the prober
//! - `Camera`: desired configuration of a camera
//! - `TemperatureSensor`: desired configuration of a temperature sensor

pub mod condition;
pub mod device;
pub mod capabilities;
pub mod camera;
pub mod temperature_sensor;

pub use condition::*;
pub use device::*;
pub use capabilities::*;
pub use camera::*;
pub use temperature_sensor::*;

/// API group shared by every homesec CRD
pub const API_GROUP: &str = "homesec.thavlik.io";

/// Finalizer guarding device deregistration
pub const DEVICE_FINALIZER: &str = "homesec.thavlik.io/device-cleanup";
