//! Device Proxy API Client
//!
//! Talks to the device proxy that fronts physical homesec devices. Every
//! device class exposes the same four operations, captured by the
//! [`DeviceClient`] trait:
//!
//! - `fetch_capabilities`: feature tags the device supports
//! - `fetch_status`: liveness and the configuration the device reports
//! - `apply`: push a desired configuration (idempotent)
//! - `deregister`: release the device when its resource is deleted
//!
//! # Example
//!
//! ```no_run
//! use device_client::{CameraClient, DeviceClient};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CameraClient::new(
//!     "http://device-proxy:8080".to_string(),
//!     None,
//!     Duration::from_secs(10),
//! )?;
//!
//! let caps = client.fetch_capabilities("192.168.0.102").await?;
//! if caps.features.contains("1080p") {
//!     client.apply("192.168.0.102", &serde_json::json!({ "resolution": "1080p" })).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod common;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod device_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{CameraClient, TemperatureSensorClient};
pub use common::HttpClient;
pub use error::DeviceError;
pub use models::*;
pub use device_trait::DeviceClient;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockDeviceClient, MockFailure};
