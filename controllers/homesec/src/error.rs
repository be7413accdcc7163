//! Controller-specific error types.
//!
//! Every error that leaves a reconciler is classified by [`ControllerError::is_retryable`];
//! the worker loop uses that to decide between a backoff requeue and giving up
//! until the next watch event.

use crate::reconciler::ResourceKind;
use crate::store::StoreError;
use crds::DeviceClass;
use device_client::DeviceError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the homesec Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Device client error
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource is missing required metadata
    #[error("Resource missing {0}")]
    MissingMetadata(&'static str),

    /// Reconciliation exceeded its deadline
    #[error("Reconciliation timed out after {0:?}")]
    Timeout(Duration),

    /// No reconciler registered for a kind
    #[error("No reconciler registered for {0}")]
    NoReconciler(ResourceKind),

    /// No device client configured for a device class
    #[error("No device client configured for {0}")]
    NoDeviceClient(DeviceClass),

    /// Device accepted a configuration but reports a different one
    #[error("Device {0} did not take up the applied configuration")]
    ConfigNotApplied(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether the failed reconciliation should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Kube(_)
            | ControllerError::Timeout(_)
            | ControllerError::ConfigNotApplied(_)
            | ControllerError::Watch(_) => true,
            ControllerError::Store(e) => e.is_retryable(),
            ControllerError::Device(e) => e.is_retryable(),
            ControllerError::Serialization(_)
            | ControllerError::InvalidConfig(_)
            | ControllerError::MissingMetadata(_)
            | ControllerError::NoReconciler(_)
            | ControllerError::NoDeviceClient(_) => false,
        }
    }
}
