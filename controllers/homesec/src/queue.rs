//! # Work Queue
//!
//! Deduplicating, rate-limited queue of reconcile keys shared by all workers.
//!
//! - A key is held by at most one worker at a time. Adding a key that is
//!   currently being processed marks it dirty; it is re-delivered exactly once
//!   after the worker calls [`WorkQueue::done`].
//! - A key waiting in the queue is never queued twice.
//! - Delayed adds for the same key coalesce to the earliest deadline.
//! - [`WorkQueue::add_rate_limited`] delays by exponential backoff on the
//!   per-key failure count; [`WorkQueue::forget`] clears the count.

use crate::backoff::ExponentialBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: HashMap<T, Instant>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> QueueState<T> {
    /// Returns true when the key was pushed onto the ready queue
    fn insert(&mut self, item: T) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    fn promote_expired(&mut self, now: Instant) {
        let expired: Vec<T> = self
            .waiting
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(item, _)| item.clone())
            .collect();
        for item in expired {
            self.waiting.remove(&item);
            self.insert(item);
        }
    }

    fn pop(&mut self) -> Option<T> {
        let item = self.queue.pop_front()?;
        self.dirty.remove(&item);
        self.processing.insert(item.clone());
        Some(item)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().min().copied()
    }
}

/// Work queue with deduplication, dirty re-delivery and per-key backoff
#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Notify,
    drained: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send,
{
    /// Create an empty queue using the given retry backoff bounds
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            ready: Notify::new(),
            drained: Notify::new(),
            backoff_base,
            backoff_max,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a key for immediate processing
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        trace!("Queue add {:?}", item);
        if state.insert(item) {
            self.ready.notify_one();
        }
    }

    /// Enqueue a key once `delay` has elapsed
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        let deadline = Instant::now() + delay;
        trace!("Queue add {:?} after {:?}", item, delay);
        state
            .waiting
            .entry(item)
            .and_modify(|existing| {
                if deadline < *existing {
                    *existing = deadline;
                }
            })
            .or_insert(deadline);
        // Wake a sleeping worker so it re-arms its timer on the new deadline
        self.ready.notify_one();
    }

    /// Enqueue a key after its backoff delay and record one more failure.
    ///
    /// Returns the delay that was applied.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let failures = {
            let mut state = self.lock();
            let count = state.failures.entry(item.clone()).or_insert(0);
            let previous = *count;
            *count = count.saturating_add(1);
            previous
        };
        let delay = ExponentialBackoff::calculate_for_error_count(failures, self.backoff_base, self.backoff_max);
        self.add_after(item, delay);
        delay
    }

    /// Clear the failure history of a key
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    /// Number of consecutive failures recorded for a key
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Number of keys ready for processing
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is ready for processing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next ready key.
    ///
    /// Returns `None` once the queue is shutting down. The caller owns the key
    /// until it calls [`WorkQueue::done`].
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before inspecting state so no wakeup is lost
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_expired(Instant::now());
                if let Some(item) = state.pop() {
                    if !state.queue.is_empty() {
                        self.ready.notify_one();
                    }
                    return Some(item);
                }
                state.next_deadline()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a dequeued key as finished, re-queueing it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.shutting_down {
            if state.processing.is_empty() {
                self.drained.notify_waiters();
            }
            return;
        }
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.ready.notify_one();
        }
    }

    /// Whether [`WorkQueue::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stop accepting keys and release every waiting worker.
    ///
    /// Keys that were queued or delayed are dropped; the resync after restart
    /// re-discovers them.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        state.waiting.clear();
        drop(state);
        self.ready.notify_waiters();
    }

    /// Shut down and wait until every in-flight key has been marked done
    pub async fn shutdown_and_drain(&self) {
        self.shutdown();
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.lock().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }
}
