//! Resource watchers.
//!
//! Each watched kind gets a task that turns watch events into reconcile keys
//! and sends them over a bounded channel. A single forwarder drains the
//! channel into the work queue, so a slow queue applies backpressure to the
//! watchers instead of buffering without bound. A separate resync task
//! re-enqueues every known key on a fixed interval.
//!
//! `Modified` events are only forwarded when something the reconciler acts
//! on changed: the generation, the deletion timestamp or the finalizers.
//! Status writes, including the controller's own, leave all three untouched
//! and are dropped here, so a failing reconcile stays on its backoff
//! schedule instead of being re-delivered by its own condition update.

use crate::backoff::ExponentialBackoff;
use crate::queue::WorkQueue;
use crate::reconciler::{ObjectKey, ReconcilerRegistry, ResourceKind};
use crate::store::{ResourceStore, WatchEvent};
use crds::DeviceResource;
use futures::StreamExt;
use kube::Resource;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Capacity of the channel between watchers and the work queue
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The parts of a resource whose change warrants a reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    generation: Option<i64>,
    deleting: bool,
    finalizers: Vec<String>,
}

impl Fingerprint {
    fn of<K: Resource>(resource: &K) -> Self {
        let meta = resource.meta();
        Self {
            generation: meta.generation,
            deleting: meta.deletion_timestamp.is_some(),
            finalizers: meta.finalizers.clone().unwrap_or_default(),
        }
    }
}

/// Tracks the last fingerprint seen per key to filter out status-only updates
#[derive(Debug, Default)]
pub(crate) struct ChangeFilter {
    seen: HashMap<ObjectKey, Fingerprint>,
}

impl ChangeFilter {
    /// Whether `event` should be turned into a reconcile
    pub(crate) fn should_forward<K: Resource>(&mut self, key: &ObjectKey, event: &WatchEvent<K>) -> bool {
        match event {
            WatchEvent::Added(resource) => {
                self.seen.insert(key.clone(), Fingerprint::of(resource));
                true
            }
            WatchEvent::Modified(resource) => {
                let current = Fingerprint::of(resource);
                match self.seen.insert(key.clone(), current.clone()) {
                    Some(previous) => previous != current,
                    None => true,
                }
            }
            WatchEvent::Deleted(_) => {
                self.seen.remove(key);
                true
            }
        }
    }
}

/// Watch one device kind and send the key of every changed resource to `events`.
///
/// The watch is restarted with backoff whenever the stream ends. Returns when
/// the receiving side of `events` is closed.
pub async fn watch_kind<K: DeviceResource>(
    store: Arc<dyn ResourceStore<K>>,
    events: mpsc::Sender<ObjectKey>,
    mut restart_backoff: ExponentialBackoff,
) {
    let kind = ResourceKind::for_device_class(K::DEVICE_CLASS);
    info!("Starting {} watcher", kind);
    let mut filter = ChangeFilter::default();

    loop {
        let mut stream = store.watch();
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!("{} watch error: {}", kind, e);
                    continue;
                }
            };
            restart_backoff.reset();

            let Some(key) = ObjectKey::for_resource(event.resource()) else {
                warn!("Ignoring {} event for a resource without namespace or name", kind);
                continue;
            };
            match &event {
                WatchEvent::Added(_) => trace!("Added {}", key),
                WatchEvent::Modified(_) => trace!("Modified {}", key),
                WatchEvent::Deleted(_) => trace!("Deleted {}", key),
            }
            if !filter.should_forward(&key, &event) {
                trace!("Status-only update of {}, not enqueued", key);
                continue;
            }
            if events.send(key).await.is_err() {
                info!("Event channel closed, stopping {} watcher", kind);
                return;
            }
        }

        let delay = restart_backoff.next_backoff();
        warn!("{} watch stream ended, restarting in {:?}", kind, delay);
        tokio::time::sleep(delay).await;
    }
}

/// Move keys from the event channel into the work queue until every sender is gone
pub async fn forward_events(mut events: mpsc::Receiver<ObjectKey>, queue: Arc<WorkQueue<ObjectKey>>) {
    while let Some(key) = events.recv().await {
        queue.add(key);
    }
    debug!("All watchers stopped, event forwarder exiting");
}

/// Enqueue the key of every resource of every registered kind. Returns the number of keys.
pub async fn resync_once(registry: &ReconcilerRegistry, queue: &WorkQueue<ObjectKey>) -> usize {
    let mut count = 0;
    for kind in registry.kinds() {
        let Some(reconciler) = registry.get(kind) else {
            continue;
        };
        match reconciler.list_keys().await {
            Ok(keys) => {
                count += keys.len();
                for key in keys {
                    queue.add(key);
                }
            }
            Err(e) => warn!("Resync of {} failed: {}", kind, e),
        }
    }
    count
}

/// Periodically re-enqueue every known resource
pub async fn resync(registry: Arc<ReconcilerRegistry>, queue: Arc<WorkQueue<ObjectKey>>, interval: Duration) {
    info!("Starting resync every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate; the watchers' initial listing covers startup
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if queue.is_shutting_down() {
            return;
        }
        let count = resync_once(&registry, &queue).await;
        debug!("Resync enqueued {} keys", count);
    }
}
