//! Mock DeviceClient for unit testing
//!
//! Emulates a fleet of devices in memory: applying a configuration makes the
//! device report it back from `fetch_status`. Failures can be injected per
//! operation, and every call is recorded for assertions.

use crate::device_trait::DeviceClient;
use crate::error::DeviceError;
use crate::models::{CapabilitySet, DeviceStatus};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Failure to inject into a mock operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    Unreachable,
    Timeout,
    NotFound,
    Rejected(String),
}

impl MockFailure {
    fn to_error(&self, device_ref: &str) -> DeviceError {
        match self {
            MockFailure::Unreachable => DeviceError::Unreachable(format!("{device_ref} unreachable")),
            MockFailure::Timeout => DeviceError::Timeout(format!("{device_ref} timed out")),
            MockFailure::NotFound => DeviceError::NotFound(format!("{device_ref} not found")),
            MockFailure::Rejected(reason) => DeviceError::Rejected(reason.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    capabilities: HashMap<String, CapabilitySet>,
    configs: HashMap<String, serde_json::Value>,
    stuck_configs: HashMap<String, serde_json::Value>,
    unreachable: HashSet<String>,
    apply_failures: Vec<MockFailure>,
    status_failures: Vec<MockFailure>,
    deregister_failures: Vec<MockFailure>,
    report_config: bool,
    apply_calls: Vec<(String, serde_json::Value)>,
    deregister_calls: Vec<String>,
    capabilities_calls: usize,
    status_calls: usize,
}

/// Mock DeviceClient for testing
#[derive(Debug, Clone)]
pub struct MockDeviceClient {
    base_url: String,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDeviceClient {
    fn default() -> Self {
        Self::new("http://mock-device-proxy")
    }
}

impl MockDeviceClient {
    /// Create a new mock client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            state: Arc::new(Mutex::new(MockState {
                report_config: true,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Register a device with the given feature tags (for test setup)
    pub fn add_device<I, S>(&self, device_ref: &str, features: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = CapabilitySet {
            features: features.into_iter().map(Into::into).collect(),
            model: Some("mock".to_string()),
            firmware_version: Some("1.0.0".to_string()),
        };
        self.state().capabilities.insert(device_ref.to_string(), set);
    }

    /// Make every call for `device_ref` fail as unreachable until cleared
    pub fn set_unreachable(&self, device_ref: &str, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(device_ref.to_string());
        } else {
            state.unreachable.remove(device_ref);
        }
    }

    /// Queue failures returned by the next `apply` calls, in order
    pub fn fail_next_applies(&self, failures: impl IntoIterator<Item = MockFailure>) {
        self.state().apply_failures.extend(failures);
    }

    /// Queue failures returned by the next `fetch_status` calls, in order
    pub fn fail_next_status(&self, failures: impl IntoIterator<Item = MockFailure>) {
        self.state().status_failures.extend(failures);
    }

    /// Queue failures returned by the next `deregister` calls, in order
    pub fn fail_next_deregisters(&self, failures: impl IntoIterator<Item = MockFailure>) {
        self.state().deregister_failures.extend(failures);
    }

    /// Whether `fetch_status` reports the applied configuration back
    pub fn set_report_config(&self, report: bool) {
        self.state().report_config = report;
    }

    /// Make `fetch_status` report `config` for `device_ref` whatever was applied,
    /// like a device that accepts a configuration but never takes it up.
    /// `None` restores normal reporting.
    pub fn set_stuck_config(&self, device_ref: &str, config: Option<serde_json::Value>) {
        let mut state = self.state();
        match config {
            Some(config) => state.stuck_configs.insert(device_ref.to_string(), config),
            None => state.stuck_configs.remove(device_ref),
        };
    }

    /// Every `apply` call that reached the device, in order
    pub fn apply_calls(&self) -> Vec<(String, serde_json::Value)> {
        self.state().apply_calls.clone()
    }

    /// Every `deregister` call, in order
    pub fn deregister_calls(&self) -> Vec<String> {
        self.state().deregister_calls.clone()
    }

    /// Number of `fetch_capabilities` calls
    pub fn capabilities_calls(&self) -> usize {
        self.state().capabilities_calls
    }

    /// Number of `fetch_status` calls
    pub fn status_calls(&self) -> usize {
        self.state().status_calls
    }

    /// Configuration currently held by the emulated device
    pub fn device_config(&self, device_ref: &str) -> Option<serde_json::Value> {
        self.state().configs.get(device_ref).cloned()
    }
}

fn take_failure(failures: &mut Vec<MockFailure>) -> Option<MockFailure> {
    if failures.is_empty() {
        None
    } else {
        Some(failures.remove(0))
    }
}

#[async_trait::async_trait]
impl DeviceClient for MockDeviceClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_capabilities(&self, device_ref: &str) -> Result<CapabilitySet, DeviceError> {
        let mut state = self.state();
        state.capabilities_calls += 1;
        if state.unreachable.contains(device_ref) {
            return Err(MockFailure::Unreachable.to_error(device_ref));
        }
        state
            .capabilities
            .get(device_ref)
            .cloned()
            .ok_or_else(|| MockFailure::NotFound.to_error(device_ref))
    }

    async fn fetch_status(&self, device_ref: &str) -> Result<DeviceStatus, DeviceError> {
        let mut state = self.state();
        state.status_calls += 1;
        if state.unreachable.contains(device_ref) {
            return Err(MockFailure::Unreachable.to_error(device_ref));
        }
        if let Some(failure) = take_failure(&mut state.status_failures) {
            return Err(failure.to_error(device_ref));
        }
        if !state.capabilities.contains_key(device_ref) {
            return Err(MockFailure::NotFound.to_error(device_ref));
        }
        let reported_config = if let Some(stuck) = state.stuck_configs.get(device_ref) {
            Some(stuck.clone())
        } else if state.report_config {
            state.configs.get(device_ref).cloned()
        } else {
            None
        };
        Ok(DeviceStatus {
            online: true,
            reported_config,
            firmware_version: Some("1.0.0".to_string()),
            uptime_seconds: Some(60),
        })
    }

    async fn apply(&self, device_ref: &str, desired_config: &serde_json::Value) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.unreachable.contains(device_ref) {
            return Err(MockFailure::Unreachable.to_error(device_ref));
        }
        state.apply_calls.push((device_ref.to_string(), desired_config.clone()));
        if let Some(failure) = take_failure(&mut state.apply_failures) {
            return Err(failure.to_error(device_ref));
        }
        state.configs.insert(device_ref.to_string(), desired_config.clone());
        Ok(())
    }

    async fn deregister(&self, device_ref: &str) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.deregister_calls.push(device_ref.to_string());
        if let Some(failure) = take_failure(&mut state.deregister_failures) {
            return Err(failure.to_error(device_ref));
        }
        if state.configs.remove(device_ref).is_none() {
            return Err(MockFailure::NotFound.to_error(device_ref));
        }
        Ok(())
    }
}
