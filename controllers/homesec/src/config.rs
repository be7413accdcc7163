//! Controller configuration loaded from environment variables.

use crate::error::ControllerError;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Device proxy base URL (`DEVICE_PROXY_URL`)
    pub device_proxy_url: String,
    /// Bearer token for the device proxy (`DEVICE_PROXY_TOKEN`)
    pub device_proxy_token: Option<String>,
    /// Namespace to watch, all namespaces when unset (`WATCH_NAMESPACE`)
    pub namespace: Option<String>,
    /// Concurrent reconciliation workers (`WORKER_COUNT`)
    pub workers: usize,
    /// Interval at which every known key is re-enqueued (`RESYNC_INTERVAL_SECS`)
    pub resync_interval: Duration,
    /// Interval between capability probes (`PROBE_INTERVAL_SECS`)
    pub probe_interval: Duration,
    /// Consecutive probe failures before a device is marked unavailable (`PROBE_FAILURE_THRESHOLD`)
    pub probe_failure_threshold: u32,
    /// Deadline for a single reconciliation (`RECONCILE_TIMEOUT_SECS`)
    pub reconcile_timeout: Duration,
    /// First retry delay after a failure (`BACKOFF_BASE_SECS`)
    pub backoff_base: Duration,
    /// Upper bound on the retry delay (`BACKOFF_MAX_SECS`)
    pub backoff_max: Duration,
    /// Fixed retry delay while Capabilities are unavailable (`CAPABILITIES_RETRY_SECS`)
    pub capabilities_retry: Duration,
    /// Per-request timeout for device proxy calls (`DEVICE_TIMEOUT_SECS`)
    pub device_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_proxy_url: "http://device-proxy.homesec:8080".to_string(),
            device_proxy_token: None,
            namespace: None,
            workers: 4,
            resync_interval: Duration::from_secs(600),
            probe_interval: Duration::from_secs(60),
            probe_failure_threshold: 3,
            reconcile_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            capabilities_retry: Duration::from_secs(15),
            device_timeout: Duration::from_secs(10),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            device_proxy_url: non_empty("DEVICE_PROXY_URL").unwrap_or(defaults.device_proxy_url),
            device_proxy_token: non_empty("DEVICE_PROXY_TOKEN"),
            namespace: non_empty("WATCH_NAMESPACE"),
            workers: parse_or(&lookup, "WORKER_COUNT", defaults.workers)?,
            resync_interval: secs_or(&lookup, "RESYNC_INTERVAL_SECS", defaults.resync_interval)?,
            probe_interval: secs_or(&lookup, "PROBE_INTERVAL_SECS", defaults.probe_interval)?,
            probe_failure_threshold: parse_or(&lookup, "PROBE_FAILURE_THRESHOLD", defaults.probe_failure_threshold)?,
            reconcile_timeout: secs_or(&lookup, "RECONCILE_TIMEOUT_SECS", defaults.reconcile_timeout)?,
            backoff_base: secs_or(&lookup, "BACKOFF_BASE_SECS", defaults.backoff_base)?,
            backoff_max: secs_or(&lookup, "BACKOFF_MAX_SECS", defaults.backoff_max)?,
            capabilities_retry: secs_or(&lookup, "CAPABILITIES_RETRY_SECS", defaults.capabilities_retry)?,
            device_timeout: secs_or(&lookup, "DEVICE_TIMEOUT_SECS", defaults.device_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig("WORKER_COUNT must be at least 1".to_string()));
        }
        if self.probe_failure_threshold == 0 {
            return Err(ControllerError::InvalidConfig(
                "PROBE_FAILURE_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(ControllerError::InvalidConfig(
                "BACKOFF_BASE_SECS must be non-zero and not exceed BACKOFF_MAX_SECS".to_string(),
            ));
        }
        for (name, value) in [
            ("RESYNC_INTERVAL_SECS", self.resync_interval),
            ("PROBE_INTERVAL_SECS", self.probe_interval),
            ("RECONCILE_TIMEOUT_SECS", self.reconcile_timeout),
            ("DEVICE_TIMEOUT_SECS", self.device_timeout),
        ] {
            if value.is_zero() {
                return Err(ControllerError::InvalidConfig(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{name}={raw}: {e}"))),
        _ => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, name, default.as_secs()).map(Duration::from_secs)
}
