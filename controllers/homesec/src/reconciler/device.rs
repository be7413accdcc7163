//! Generic reconciler for device resources (Camera, TemperatureSensor).
//!
//! One reconciliation performs, in order:
//!
//! 1. Re-read the resource; a vanished resource is a no-op.
//! 2. If it is being deleted, deregister the device and release the finalizer.
//! 3. Otherwise make sure the finalizer is present.
//! 4. Gate on the device's Capabilities: missing or unavailable capabilities
//!    requeue after a fixed interval and ask the prober for a fresh probe.
//! 5. Validate the desired config and check every required feature is supported.
//! 6. Skip the device entirely when the observed config and generation match.
//! 7. Apply the config, read back the device status and record the result.

use super::{Action, ObjectKey, Reconcile, ResourceKind};
use crate::error::ControllerError;
use crate::prober::ProbeRequest;
use crate::reconcile_helpers::{
    find_capabilities, has_finalizer, set_condition, status_needs_update, with_finalizer, without_finalizer,
};
use crate::store::ResourceStore;
use async_trait::async_trait;
use chrono::Utc;
use crds::{
    reason, unsupported_features, Capabilities, ConditionStatus, DeviceConfig, DeviceResource, DEVICE_FINALIZER,
    READY,
};
use device_client::{DeviceClient, DeviceError};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reconciler for one device resource kind
pub struct DeviceReconciler<K: DeviceResource> {
    store: Arc<dyn ResourceStore<K>>,
    capabilities: Arc<dyn ResourceStore<Capabilities>>,
    client: Arc<dyn DeviceClient>,
    probe_requests: Option<mpsc::Sender<ProbeRequest>>,
    capabilities_retry: Duration,
}

impl<K: DeviceResource> DeviceReconciler<K> {
    /// Reconciler for resources in `store`, gated on `capabilities`
    pub fn new(
        store: Arc<dyn ResourceStore<K>>,
        capabilities: Arc<dyn ResourceStore<Capabilities>>,
        client: Arc<dyn DeviceClient>,
        capabilities_retry: Duration,
    ) -> Self {
        Self {
            store,
            capabilities,
            client,
            probe_requests: None,
            capabilities_retry,
        }
    }

    /// Ask the prober for an immediate probe whenever capabilities are missing
    pub fn with_probe_requests(mut self, probe_requests: mpsc::Sender<ProbeRequest>) -> Self {
        self.probe_requests = Some(probe_requests);
        self
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::for_device_class(K::DEVICE_CLASS)
    }

    /// Set the Ready condition on a copy of `resource`
    fn with_ready(&self, resource: &K, status: ConditionStatus, reason: &str, message: &str) -> K {
        let mut updated = resource.clone();
        set_condition(
            &mut updated.device_status_mut().conditions,
            READY,
            status,
            reason,
            message,
            Utc::now(),
        );
        updated
    }

    /// Write the status of `updated` if it differs from `original`
    async fn write_status(&self, original: &K, updated: K) -> Result<K, ControllerError> {
        if !status_needs_update(original.device_status(), updated.device_status()) {
            debug!("Status of {} {} unchanged, skipping write", self.kind(), updated.name_any());
            return Ok(updated);
        }
        Ok(self.store.update_status(&updated).await?)
    }

    /// Record a failure condition without masking the error that caused it
    async fn record_failure(&self, resource: &K, reason: &str, message: &str) {
        let updated = self.with_ready(resource, ConditionStatus::False, reason, message);
        if let Err(e) = self.write_status(resource, updated).await {
            warn!(
                "Failed to record {} condition on {} {}: {}",
                reason,
                self.kind(),
                resource.name_any(),
                e
            );
        }
    }

    fn request_probe(&self, namespace: &str, device_ref: &str) {
        let Some(sender) = &self.probe_requests else {
            return;
        };
        let request = ProbeRequest {
            namespace: namespace.to_string(),
            device_ref: device_ref.to_string(),
            device_class: K::DEVICE_CLASS,
        };
        if let Err(e) = sender.try_send(request) {
            debug!("Probe request for {} not queued: {}", device_ref, e);
        }
    }

    /// Deregister the device and release the finalizer
    async fn finalize(&self, resource: K) -> Result<Action, ControllerError> {
        let name = resource.name_any();
        if !has_finalizer(&resource, DEVICE_FINALIZER) {
            debug!("{} {} is being deleted and holds no finalizer", self.kind(), name);
            return Ok(Action::await_change());
        }

        let device_ref = resource.device_ref().to_string();
        match self.client.deregister(&device_ref).await {
            Ok(()) => info!("Deregistered device {} for {} {}", device_ref, self.kind(), name),
            Err(DeviceError::NotFound(_)) => {
                debug!("Device {} already gone, nothing to deregister", device_ref);
            }
            Err(e) => {
                warn!("Failed to deregister device {} for {} {}: {}", device_ref, self.kind(), name, e);
                self.record_failure(&resource, reason::DEREGISTER_FAILED, &e.to_string())
                    .await;
                return Err(e.into());
            }
        }

        self.store
            .update(&without_finalizer(&resource, DEVICE_FINALIZER))
            .await?;
        info!("Removed finalizer from {} {}", self.kind(), name);
        Ok(Action::await_change())
    }

    async fn reconcile_resource(&self, resource: K) -> Result<Action, ControllerError> {
        let name = resource.name_any();
        let namespace = resource
            .namespace()
            .ok_or(ControllerError::MissingMetadata("namespace"))?;

        // Step 3: finalizer first, so a device is never configured without
        // the cleanup hook in place
        let resource = if has_finalizer(&resource, DEVICE_FINALIZER) {
            resource
        } else {
            debug!("Adding finalizer to {} {}", self.kind(), name);
            self.store
                .update(&with_finalizer(&resource, DEVICE_FINALIZER))
                .await?
        };

        let device_ref = resource.device_ref().to_string();
        let desired = resource.desired_config().clone();
        let generation = resource.meta().generation;

        // Step 4: dependency gate
        let capabilities = find_capabilities(self.capabilities.as_ref(), &namespace, &device_ref).await?;
        let capabilities = match capabilities {
            Some(caps) if caps.is_available() => caps,
            other => {
                let message = if other.is_some() {
                    format!("capabilities for device {device_ref} are unavailable")
                } else {
                    format!("no capabilities found for device {device_ref}")
                };
                info!(
                    "{} {}: {}, retrying in {:?}",
                    self.kind(),
                    name,
                    message,
                    self.capabilities_retry
                );
                self.request_probe(&namespace, &device_ref);
                let updated = self.with_ready(
                    &resource,
                    ConditionStatus::False,
                    reason::CAPABILITIES_UNAVAILABLE,
                    &message,
                );
                self.write_status(&resource, updated).await?;
                return Ok(Action::requeue(self.capabilities_retry));
            }
        };

        // Step 5: validation
        if let Err(e) = desired.validate() {
            warn!("{} {} has an invalid configuration: {}", self.kind(), name, e);
            let updated = self.with_ready(&resource, ConditionStatus::False, reason::INVALID_CONFIG, &e.to_string());
            self.write_status(&resource, updated).await?;
            return Ok(Action::await_change());
        }
        let missing = unsupported_features(&desired, &capabilities.supported_features());
        if !missing.is_empty() {
            let message = format!("requested features not supported by device: {}", missing.join(", "));
            warn!("{} {}: {}", self.kind(), name, message);
            let updated = self.with_ready(&resource, ConditionStatus::False, reason::UNSUPPORTED_FEATURE, &message);
            self.write_status(&resource, updated).await?;
            return Ok(Action::await_change());
        }

        // Step 6: converged already
        let status = resource.device_status();
        let converged = status.is_some_and(|s| {
            s.observed_config.as_ref() == Some(&desired) && s.observed_generation == generation
        });
        if converged {
            debug!("{} {} already converged at generation {:?}", self.kind(), name, generation);
            let updated = self.with_ready(&resource, ConditionStatus::True, reason::RECONCILED, "configuration applied");
            self.write_status(&resource, updated).await?;
            return Ok(Action::await_change());
        }

        // Step 7: apply and observe
        let config = serde_json::to_value(&desired)?;
        if let Err(e) = self.client.apply(&device_ref, &config).await {
            warn!("Failed to apply configuration to device {} for {} {}: {}", device_ref, self.kind(), name, e);
            self.record_failure(&resource, reason::APPLY_FAILED, &e.to_string()).await;
            return Err(e.into());
        }

        let device_status = match self.client.fetch_status(&device_ref).await {
            Ok(device_status) => device_status,
            Err(e) => {
                warn!("Applied configuration to {} but could not read its status: {}", device_ref, e);
                self.record_failure(&resource, reason::STATUS_UNAVAILABLE, &e.to_string())
                    .await;
                return Err(e.into());
            }
        };

        let observed = match device_status.reported_config {
            Some(reported) => match serde_json::from_value::<K::Config>(reported) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Device {} reported an unreadable configuration: {}", device_ref, e);
                    desired.clone()
                }
            },
            None => desired.clone(),
        };

        // A device that reports something else only took part of the config
        if observed != desired {
            warn!(
                "Device {} for {} {} reports {:?} after applying {:?}",
                device_ref,
                self.kind(),
                name,
                observed,
                desired
            );
            let mut updated = self.with_ready(
                &resource,
                ConditionStatus::False,
                reason::APPLY_FAILED,
                "device reports a configuration different from the one applied",
            );
            updated.device_status_mut().observed_config = Some(observed);
            self.write_status(&resource, updated).await?;
            return Err(ControllerError::ConfigNotApplied(device_ref));
        }

        let mut updated = self.with_ready(&resource, ConditionStatus::True, reason::RECONCILED, "configuration applied");
        let status = updated.device_status_mut();
        status.observed_config = Some(observed);
        status.observed_generation = generation;
        self.write_status(&resource, updated).await?;
        info!(
            "Reconciled {} {} (device {}, generation {:?})",
            self.kind(),
            name,
            device_ref,
            generation
        );
        Ok(Action::await_change())
    }
}

#[async_trait]
impl<K: DeviceResource> Reconcile for DeviceReconciler<K> {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let Some(resource) = self.store.get(&key.namespace, &key.name).await? else {
            debug!("{} no longer exists, nothing to reconcile", key);
            return Ok(Action::await_change());
        };

        if resource.meta().deletion_timestamp.is_some() {
            return self.finalize(resource).await;
        }
        self.reconcile_resource(resource).await
    }

    async fn list_keys(&self) -> Result<Vec<ObjectKey>, ControllerError> {
        Ok(self
            .store
            .list(None)
            .await?
            .iter()
            .filter_map(ObjectKey::for_resource)
            .collect())
    }
}
