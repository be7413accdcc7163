//! Main controller implementation.
//!
//! The `Controller` wires together the resource stores, device clients,
//! reconcilers, watchers, the resync loop, the capabilities prober and a pool
//! of workers sharing one work queue.

use crate::backoff::ExponentialBackoff;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::prober::{CapabilitiesProber, ProbeRequest};
use crate::queue::WorkQueue;
use crate::reconciler::{
    CameraReconciler, DeviceClients, ObjectKey, ReconcilerRegistry, ResourceKind, TemperatureSensorReconciler,
};
use crate::store::{KubeStore, ResourceStore};
use crate::watcher::{forward_events, resync, watch_kind, EVENT_CHANNEL_CAPACITY};
use crds::{Camera, Capabilities, DeviceClass, TemperatureSensor};
use device_client::{CameraClient, TemperatureSensorClient};
use futures::future::select_all;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the on-demand probe request channel
const PROBE_CHANNEL_CAPACITY: usize = 64;

/// Resource stores for every kind the controller touches
#[derive(Clone)]
pub struct Stores {
    pub cameras: Arc<dyn ResourceStore<Camera>>,
    pub temperature_sensors: Arc<dyn ResourceStore<TemperatureSensor>>,
    pub capabilities: Arc<dyn ResourceStore<Capabilities>>,
}

impl Stores {
    /// Stores backed by the Kubernetes API
    pub fn kube(client: Client, namespace: Option<String>) -> Self {
        Self {
            cameras: Arc::new(KubeStore::<Camera>::new(client.clone(), namespace.clone())),
            temperature_sensors: Arc::new(KubeStore::<TemperatureSensor>::new(client.clone(), namespace.clone())),
            capabilities: Arc::new(KubeStore::<Capabilities>::new(client, namespace)),
        }
    }
}

/// HTTP device clients for the device proxy
pub fn device_clients(config: &ControllerConfig) -> Result<DeviceClients, ControllerError> {
    let cameras = CameraClient::new(
        config.device_proxy_url.clone(),
        config.device_proxy_token.clone(),
        config.device_timeout,
    )?;
    let sensors = TemperatureSensorClient::new(
        config.device_proxy_url.clone(),
        config.device_proxy_token.clone(),
        config.device_timeout,
    )?;
    Ok(DeviceClients::new()
        .with(DeviceClass::Camera, Arc::new(cameras))
        .with(DeviceClass::TemperatureSensor, Arc::new(sensors)))
}

/// Build the reconciler for every device kind
pub fn build_registry(
    stores: &Stores,
    clients: &DeviceClients,
    probe_requests: mpsc::Sender<ProbeRequest>,
    config: &ControllerConfig,
) -> Result<ReconcilerRegistry, ControllerError> {
    let cameras = CameraReconciler::new(
        stores.cameras.clone(),
        stores.capabilities.clone(),
        clients.get(DeviceClass::Camera)?,
        config.capabilities_retry,
    )
    .with_probe_requests(probe_requests.clone());
    let sensors = TemperatureSensorReconciler::new(
        stores.temperature_sensors.clone(),
        stores.capabilities.clone(),
        clients.get(DeviceClass::TemperatureSensor)?,
        config.capabilities_retry,
    )
    .with_probe_requests(probe_requests);

    let mut registry = ReconcilerRegistry::new();
    registry.register(ResourceKind::Camera, Arc::new(cameras));
    registry.register(ResourceKind::TemperatureSensor, Arc::new(sensors));
    Ok(registry)
}

/// Process one key from the queue. Returns false once the queue is shut down.
pub async fn process_next(
    queue: &WorkQueue<ObjectKey>,
    registry: &ReconcilerRegistry,
    reconcile_timeout: Duration,
) -> bool {
    let Some(key) = queue.dequeue().await else {
        return false;
    };

    let result = match registry.get(key.kind) {
        Some(reconciler) => match tokio::time::timeout(reconcile_timeout, reconciler.reconcile(&key)).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::Timeout(reconcile_timeout)),
        },
        None => Err(ControllerError::NoReconciler(key.kind)),
    };

    match result {
        Ok(action) => {
            queue.forget(&key);
            if let Some(delay) = action.requeue_after() {
                debug!("Requeueing {} in {:?}", key, delay);
                queue.add_after(key.clone(), delay);
            }
        }
        Err(e) if e.is_retryable() => {
            let delay = queue.add_rate_limited(key.clone());
            warn!(
                "Reconciliation of {} failed (attempt {}), retrying in {:?}: {}",
                key,
                queue.num_requeues(&key),
                delay,
                e
            );
        }
        Err(e) => {
            queue.forget(&key);
            error!("Reconciliation of {} failed permanently: {}", key, e);
        }
    }
    queue.done(&key);
    true
}

async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    registry: Arc<ReconcilerRegistry>,
    reconcile_timeout: Duration,
) {
    debug!("Worker {} started", id);
    while process_next(&queue, &registry, reconcile_timeout).await {}
    debug!("Worker {} stopped", id);
}

/// Spawn `count` workers sharing `queue`
pub fn spawn_workers(
    count: usize,
    queue: &Arc<WorkQueue<ObjectKey>>,
    registry: &Arc<ReconcilerRegistry>,
    reconcile_timeout: Duration,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| tokio::spawn(run_worker(id, queue.clone(), registry.clone(), reconcile_timeout)))
        .collect()
}

/// Main controller for home-security device resources.
pub struct Controller {
    queue: Arc<WorkQueue<ObjectKey>>,
    workers: Vec<JoinHandle<()>>,
    /// Watchers, forwarder, resync and prober
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Controller {
    /// Creates a controller talking to the cluster and the device proxy.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing homesec Controller");

        let kube_client = Client::try_default().await?;
        let stores = Stores::kube(kube_client, config.namespace.clone());
        let clients = device_clients(&config)?;

        Self::start(&config, stores, clients)
    }

    /// Start every task against the given stores and device clients
    pub fn start(config: &ControllerConfig, stores: Stores, clients: DeviceClients) -> Result<Self, ControllerError> {
        let (probe_tx, probe_rx) = mpsc::channel(PROBE_CHANNEL_CAPACITY);
        let registry = Arc::new(build_registry(&stores, &clients, probe_tx, config)?);
        let queue = Arc::new(WorkQueue::new(config.backoff_base, config.backoff_max));
        let restart_backoff = ExponentialBackoff::new(config.backoff_base, config.backoff_max);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut tasks = vec![
            (
                "Camera watcher",
                tokio::spawn(watch_kind(
                    stores.cameras.clone(),
                    events_tx.clone(),
                    restart_backoff.clone(),
                )),
            ),
            (
                "TemperatureSensor watcher",
                tokio::spawn(watch_kind(
                    stores.temperature_sensors.clone(),
                    events_tx,
                    restart_backoff,
                )),
            ),
            ("event forwarder", tokio::spawn(forward_events(events_rx, queue.clone()))),
            (
                "resync",
                tokio::spawn(resync(registry.clone(), queue.clone(), config.resync_interval)),
            ),
        ];

        let prober = CapabilitiesProber::new(
            stores.capabilities.clone(),
            clients,
            config.namespace.clone(),
            config.probe_failure_threshold,
        );
        tasks.push(("prober", tokio::spawn(prober.run(config.probe_interval, probe_rx))));

        let workers = spawn_workers(config.workers, &queue, &registry, config.reconcile_timeout);
        info!(
            "homesec Controller started with {} workers (namespace: {})",
            config.workers,
            config.namespace.as_deref().unwrap_or("all namespaces")
        );

        Ok(Self { queue, workers, tasks })
    }

    /// Run until a shutdown signal arrives or a background task stops
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("homesec Controller running");

        let (names, mut handles): (Vec<&'static str>, Vec<JoinHandle<()>>) = self.tasks.drain(..).unzip();
        let outcome = tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    info!("Received shutdown signal");
                    Ok(())
                }
                Err(e) => Err(ControllerError::Watch(format!("Failed to listen for shutdown signal: {e}"))),
            },
            (result, index, _) = select_all(handles.iter_mut()) => {
                let name = names.get(index).copied().unwrap_or("background task");
                match result {
                    Ok(()) => Err(ControllerError::Watch(format!("{name} stopped unexpectedly"))),
                    Err(e) => Err(ControllerError::Watch(format!("{name} panicked: {e}"))),
                }
            }
        };

        self.tasks = names.into_iter().zip(handles).collect();
        self.shutdown().await;
        outcome
    }

    /// Stop intake, wait for in-flight reconciliations and stop the workers
    pub async fn shutdown(self) {
        for (name, task) in &self.tasks {
            debug!("Stopping {}", name);
            task.abort();
        }
        if !self.queue.is_empty() {
            info!("Dropping {} queued keys, the next resync after restart picks them up", self.queue.len());
        }
        self.queue.shutdown_and_drain().await;
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Worker exited abnormally: {}", e);
            }
        }
        info!("homesec Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{Action, Reconcile};
    use crate::store::MemoryStore;
    use crate::test_utils::{available_capabilities, camera, clients_for};
    use async_trait::async_trait;
    use crds::{find_condition, ConditionStatus, READY};
    use device_client::{MockDeviceClient, MockFailure};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            workers: 2,
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(200),
            capabilities_retry: Duration::from_millis(50),
            reconcile_timeout: Duration::from_secs(5),
            ..ControllerConfig::default()
        }
    }

    fn queue() -> Arc<WorkQueue<ObjectKey>> {
        Arc::new(WorkQueue::new(Duration::from_millis(10), Duration::from_millis(100)))
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(ResourceKind::Camera, "home", name)
    }

    /// Records overlapping reconciliations of the same key
    #[derive(Default)]
    struct ExclusivityProbe {
        in_flight: Mutex<HashSet<ObjectKey>>,
        overlaps: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconcile for ExclusivityProbe {
        async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
            if !self.in_flight.lock().unwrap().insert(key.clone()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.lock().unwrap().remove(key);
            Ok(Action::await_change())
        }

        async fn list_keys(&self) -> Result<Vec<ObjectKey>, ControllerError> {
            Ok(Vec::new())
        }
    }

    /// Fails a fixed number of times, then succeeds
    struct Flaky {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        retryable: bool,
    }

    #[async_trait]
    impl Reconcile for Flaky {
        async fn reconcile(&self, _key: &ObjectKey) -> Result<Action, ControllerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(if self.retryable {
                    ControllerError::Device(device_client::DeviceError::Timeout("cam-1".into()))
                } else {
                    ControllerError::InvalidConfig("bad".into())
                });
            }
            Ok(Action::await_change())
        }

        async fn list_keys(&self) -> Result<Vec<ObjectKey>, ControllerError> {
            Ok(Vec::new())
        }
    }

    /// Never finishes within any reasonable deadline
    struct Hanging;

    #[async_trait]
    impl Reconcile for Hanging {
        async fn reconcile(&self, _key: &ObjectKey) -> Result<Action, ControllerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Action::await_change())
        }

        async fn list_keys(&self) -> Result<Vec<ObjectKey>, ControllerError> {
            Ok(Vec::new())
        }
    }

    fn registry_with(reconciler: Arc<dyn Reconcile>) -> Arc<ReconcilerRegistry> {
        let mut registry = ReconcilerRegistry::new();
        registry.register(ResourceKind::Camera, reconciler);
        Arc::new(registry)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_concurrent_reconciles_for_same_key() {
        let probe = Arc::new(ExclusivityProbe::default());
        let registry = registry_with(probe.clone());
        let queue = queue();
        let workers = spawn_workers(8, &queue, &registry, Duration::from_secs(5));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for round in 0..200 {
                        queue.add(key(&format!("cam-{}", round % 3)));
                        if round % 20 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        queue.shutdown_and_drain().await;
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);
        assert!(probe.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_retryable_error_is_requeued_with_backoff() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
            retryable: true,
        });
        let registry = registry_with(flaky.clone());
        let queue = queue();
        queue.add(key("front-door"));

        for expected_failures in 1..=2 {
            assert!(process_next(&queue, &registry, Duration::from_secs(1)).await);
            assert_eq!(queue.num_requeues(&key("front-door")), expected_failures);
        }
        assert!(process_next(&queue, &registry, Duration::from_secs(1)).await);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        // Success clears the failure history
        assert_eq!(queue.num_requeues(&key("front-door")), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_requeued() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
            retryable: false,
        });
        let registry = registry_with(flaky.clone());
        let queue = queue();
        queue.add(key("front-door"));

        assert!(process_next(&queue, &registry, Duration::from_secs(1)).await);
        assert_eq!(queue.num_requeues(&key("front-door")), 0);
        let next = tokio::time::timeout(Duration::from_millis(100), queue.dequeue()).await;
        assert!(next.is_err(), "terminal failures must not be retried");
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let registry = registry_with(Arc::new(Hanging));
        let queue = queue();
        queue.add(key("front-door"));

        assert!(process_next(&queue, &registry, Duration::from_millis(20)).await);
        assert_eq!(queue.num_requeues(&key("front-door")), 1);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_dropped() {
        let registry = Arc::new(ReconcilerRegistry::new());
        let queue = queue();
        queue.add(key("front-door"));

        assert!(process_next(&queue, &registry, Duration::from_secs(1)).await);
        assert_eq!(queue.num_requeues(&key("front-door")), 0);
        queue.shutdown();
        assert!(!process_next(&queue, &registry, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_build_registry_requires_clients() {
        let stores = memory_stores().0;
        let (tx, _rx) = mpsc::channel(1);
        let result = build_registry(&stores, &DeviceClients::new(), tx, &test_config());
        assert!(matches!(result, Err(ControllerError::NoDeviceClient(_))));
    }

    fn memory_stores() -> (Stores, Arc<MemoryStore<Camera>>, Arc<MemoryStore<Capabilities>>) {
        let cameras: Arc<MemoryStore<Camera>> = Arc::new(MemoryStore::new());
        let capabilities: Arc<MemoryStore<Capabilities>> = Arc::new(MemoryStore::new());
        let stores = Stores {
            cameras: cameras.clone(),
            temperature_sensors: Arc::new(MemoryStore::<TemperatureSensor>::new()),
            capabilities: capabilities.clone(),
        };
        (stores, cameras, capabilities)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    fn is_ready(cameras: &MemoryStore<Camera>, name: &str) -> bool {
        cameras
            .snapshot("home", name)
            .and_then(|cam| cam.status)
            .and_then(|status| find_condition(&status.conditions, READY).map(|c| c.status))
            == Some(ConditionStatus::True)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_controller_converges_and_cleans_up() {
        let (stores, cameras, capabilities) = memory_stores();
        let device = Arc::new(MockDeviceClient::default());
        device.add_device("cam-1", ["1080p", "720p"]);
        device.fail_next_applies([MockFailure::Timeout]);
        capabilities.insert(available_capabilities("home", "cam-1", &["1080p", "720p"]));
        cameras.insert(camera("home", "front-door", "cam-1", "1080p"));

        let controller = Controller::start(&test_config(), stores, clients_for(&device)).unwrap();

        // The first apply times out; the backoff retry converges
        assert!(wait_until(|| is_ready(&cameras, "front-door")).await);
        assert_eq!(device.apply_calls().len(), 2);

        cameras.delete("home", "front-door");
        assert!(wait_until(|| cameras.snapshot("home", "front-door").is_none()).await);
        assert_eq!(device.deregister_calls(), vec!["cam-1".to_string()]);

        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_conditions_do_not_bypass_backoff() {
        let (stores, cameras, capabilities) = memory_stores();
        let device = Arc::new(MockDeviceClient::default());
        device.add_device("cam-1", ["1080p"]);
        // Alternating errors change the condition message on every attempt
        device.fail_next_applies((0..20).map(|i| {
            if i % 2 == 0 {
                MockFailure::Timeout
            } else {
                MockFailure::Unreachable
            }
        }));
        capabilities.insert(available_capabilities("home", "cam-1", &["1080p"]));
        cameras.insert(camera("home", "front-door", "cam-1", "1080p"));

        let config = ControllerConfig {
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(2),
            ..test_config()
        };
        let controller = Controller::start(&config, stores, clients_for(&device)).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // Initial attempt, the re-delivery caused by adding the finalizer,
        // then backoff retries at 200ms and 1s
        let attempts = device.apply_calls().len();
        assert!((1..=4).contains(&attempts), "expected backoff to hold, saw {attempts} apply calls");
        let cam = cameras.snapshot("home", "front-door").unwrap();
        let ready = find_condition(&cam.status.unwrap().conditions, READY).cloned().unwrap();
        assert_eq!(ready.reason, crds::reason::APPLY_FAILED);

        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_controller_keeps_diverged_device_not_ready() {
        let (stores, cameras, capabilities) = memory_stores();
        let device = Arc::new(MockDeviceClient::default());
        device.add_device("cam-1", ["1080p", "720p"]);
        device.set_stuck_config("cam-1", Some(serde_json::json!({"resolution": "720p"})));
        capabilities.insert(available_capabilities("home", "cam-1", &["1080p", "720p"]));
        cameras.insert(camera("home", "front-door", "cam-1", "1080p"));

        let controller = Controller::start(&test_config(), stores, clients_for(&device)).unwrap();

        assert!(wait_until(|| device.apply_calls().len() >= 3).await);
        assert!(!is_ready(&cameras, "front-door"));
        let status = cameras.snapshot("home", "front-door").unwrap().status.unwrap();
        assert_eq!(status.observed_generation, None);

        device.set_stuck_config("cam-1", None);
        assert!(wait_until(|| is_ready(&cameras, "front-door")).await);
        let status = cameras.snapshot("home", "front-door").unwrap().status.unwrap();
        assert_eq!(status.observed_generation, Some(1));

        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_controller_waits_for_capabilities_from_prober() {
        let (stores, cameras, capabilities) = memory_stores();
        let device = Arc::new(MockDeviceClient::default());
        device.add_device("cam-1", ["1080p"]);
        cameras.insert(camera("home", "front-door", "cam-1", "1080p"));

        let controller = Controller::start(&test_config(), stores, clients_for(&device)).unwrap();

        // No Capabilities exist yet: the reconciler asks the prober, which
        // creates them, and the fixed requeue picks the camera up again
        assert!(wait_until(|| is_ready(&cameras, "front-door")).await);
        let caps = capabilities.snapshot("home", "cam-1").unwrap();
        assert!(caps.is_available());

        controller.shutdown().await;
    }
}
