//! Capabilities prober.
//!
//! Keeps Capabilities resources current by asking devices what they support.
//! Every device named by an existing Capabilities resource is probed on a
//! fixed interval; reconcilers can additionally request an immediate probe of
//! a device that has no Capabilities yet.
//!
//! A successful probe marks the device available and resets the failure
//! count. Failed probes are counted and the device is marked unavailable once
//! the count reaches the configured threshold.

use crate::error::ControllerError;
use crate::reconcile_helpers::find_capabilities;
use crate::reconciler::DeviceClients;
use crate::store::{ResourceStore, StoreError};
use chrono::Utc;
use crds::{capabilities_name, Capabilities, CapabilitiesSpec, CapabilitiesStatus, DeviceClass};
use device_client::CapabilitySet;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Request to probe one device now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Namespace the Capabilities resource lives in
    pub namespace: String,
    /// Device to probe
    pub device_ref: String,
    /// Selects the device client
    pub device_class: DeviceClass,
}

impl ProbeRequest {
    fn for_capabilities(caps: &Capabilities) -> Option<Self> {
        Some(Self {
            namespace: caps.namespace()?,
            device_ref: caps.spec.device_ref.clone(),
            device_class: caps.spec.device_class,
        })
    }
}

/// Keeps Capabilities resources in line with what devices advertise
pub struct CapabilitiesProber {
    store: Arc<dyn ResourceStore<Capabilities>>,
    clients: DeviceClients,
    namespace: Option<String>,
    failure_threshold: u32,
}

impl CapabilitiesProber {
    /// Prober that marks a device unavailable after `failure_threshold` consecutive failures
    pub fn new(
        store: Arc<dyn ResourceStore<Capabilities>>,
        clients: DeviceClients,
        namespace: Option<String>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            store,
            clients,
            namespace,
            failure_threshold,
        }
    }

    /// Probe one device and record the outcome on its Capabilities resource.
    ///
    /// A failed probe is recorded first and then returned as the error.
    pub async fn probe(&self, request: &ProbeRequest) -> Result<Capabilities, ControllerError> {
        let client = self.clients.get(request.device_class)?;
        let existing = find_capabilities(self.store.as_ref(), &request.namespace, &request.device_ref).await?;

        match client.fetch_capabilities(&request.device_ref).await {
            Ok(set) => self.record_success(request, existing, set).await,
            Err(e) => {
                match existing {
                    Some(caps) => self.record_failure(caps, &e.to_string()).await?,
                    None => debug!(
                        "Probe of unknown device {} failed, nothing to record: {}",
                        request.device_ref, e
                    ),
                }
                Err(e.into())
            }
        }
    }

    async fn record_success(
        &self,
        request: &ProbeRequest,
        existing: Option<Capabilities>,
        set: CapabilitySet,
    ) -> Result<Capabilities, ControllerError> {
        let caps = match existing {
            Some(caps) => caps,
            None => self.create(request).await?,
        };

        let was_available = caps.is_available();
        let mut updated = caps.clone();
        updated.status = Some(CapabilitiesStatus {
            available: true,
            supported_features: set.features,
            last_probed_at: Some(Utc::now()),
            consecutive_failures: 0,
            model: set.model,
            firmware_version: set.firmware_version,
            error: None,
        });
        let written = self.store.update_status(&updated).await?;
        if !was_available {
            info!(
                "Device {} is available with features {:?}",
                request.device_ref,
                written.supported_features()
            );
        }
        Ok(written)
    }

    async fn create(&self, request: &ProbeRequest) -> Result<Capabilities, ControllerError> {
        let name = capabilities_name(&request.device_ref);
        let mut caps = Capabilities::new(
            &name,
            CapabilitiesSpec {
                device_ref: request.device_ref.clone(),
                device_class: request.device_class,
            },
        );
        caps.metadata.namespace = Some(request.namespace.clone());

        match self.store.create(&caps).await {
            Ok(created) => {
                info!("Created Capabilities {}/{} for device {}", request.namespace, name, request.device_ref);
                Ok(created)
            }
            Err(StoreError::AlreadyExists(_)) => {
                // Another resource took the name; reuse it only if it describes the same device
                match self.store.get(&request.namespace, &name).await? {
                    Some(existing) if existing.spec.device_ref == request.device_ref => Ok(existing),
                    _ => Err(StoreError::AlreadyExists(name).into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_failure(&self, caps: Capabilities, error: &str) -> Result<(), ControllerError> {
        let mut status = caps.status.clone().unwrap_or_default();
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        status.error = Some(error.to_string());
        if status.available && status.consecutive_failures >= self.failure_threshold {
            status.available = false;
            warn!(
                "Device {} marked unavailable after {} consecutive probe failures",
                caps.spec.device_ref, status.consecutive_failures
            );
        }

        let mut updated = caps;
        updated.status = Some(status);
        self.store.update_status(&updated).await?;
        Ok(())
    }

    /// Probe every device that has a Capabilities resource. Returns the number of successful probes.
    pub async fn probe_all(&self) -> Result<usize, ControllerError> {
        let known = self.store.list(self.namespace.as_deref()).await?;
        let mut succeeded = 0;
        for request in known.iter().filter_map(ProbeRequest::for_capabilities) {
            match self.probe(&request).await {
                Ok(_) => succeeded += 1,
                Err(e) => warn!("Probe of device {} failed: {}", request.device_ref, e),
            }
        }
        Ok(succeeded)
    }

    /// Probe on `interval` and on request until the request channel closes
    pub async fn run(self, interval: Duration, mut requests: mpsc::Receiver<ProbeRequest>) {
        info!("Starting capabilities prober (interval {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.probe_all().await {
                    Ok(count) => debug!("Periodic probe finished, {} devices available", count),
                    Err(e) => warn!("Periodic probe failed: {}", e),
                },
                request = requests.recv() => match request {
                    Some(request) => {
                        if let Err(e) = self.probe(&request).await {
                            warn!("Requested probe of device {} failed: {}", request.device_ref, e);
                        }
                    }
                    None => {
                        info!("Probe request channel closed, stopping prober");
                        return;
                    }
                },
            }
        }
    }
}
