//! homesec Controller
//!
//! Reconciles home-security device resources against the devices themselves:
//! - Camera: applies the desired camera configuration
//! - TemperatureSensor: applies the desired sampling configuration
//! - Capabilities: probed periodically, gate every configuration change
//!
//! Devices are reached through the device proxy REST API.

mod backoff;
mod config;
mod controller;
mod error;
mod prober;
mod queue;
mod reconcile_helpers;
mod reconciler;
mod store;
#[cfg(test)]
mod test_utils;
mod watcher;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and reqwest both build rustls clients; pin the process-wide provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting homesec Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Device proxy URL: {}", config.device_proxy_url);
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers: {}", config.workers);
    info!("  Resync interval: {:?}", config.resync_interval);
    info!("  Probe interval: {:?}", config.probe_interval);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
